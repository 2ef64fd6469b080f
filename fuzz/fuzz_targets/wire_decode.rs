#![no_main]

use ioeye::event::{decode_records, IoEvent};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(events) = decode_records(data) {
        for event in events {
            // Anything that decodes must survive a re-encode unchanged
            assert_eq!(IoEvent::from_wire(&event.to_wire()), Ok(event));
        }
    }
});
