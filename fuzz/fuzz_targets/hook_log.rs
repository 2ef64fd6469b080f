#![no_main]

use ioeye::config::TracerConfig;
use ioeye::replay::Replayer;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary hook sequences must never panic the tracer
    let config = TracerConfig {
        request_capacity: 8,
        call_capacity: 8,
        aggregator_capacity: 4,
        event_capacity: 16,
        ..TracerConfig::default()
    };
    if let Ok((mut replayer, events)) = Replayer::new(&config) {
        let _ = replayer.run(data);
        events.drain(usize::MAX);
        replayer.finish();
    }
});
