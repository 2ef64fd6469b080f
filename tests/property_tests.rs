//! Property-based tests for correlation and aggregation
//!
//! Properties covered:
//! 1. Per-pid totals equal the sum of matched durations (accumulation)
//! 2. Every matched pair yields exactly one event with end >= start
//! 3. Completions without a start change nothing
//! 4. Table occupancy never exceeds capacity, under any policy
//! 5. Wire decoding never panics on arbitrary bytes

use ioeye::clock::{ManualClock, ManualTasks, Task};
use ioeye::config::TracerConfig;
use ioeye::correlation::{BeginPolicy, CorrelationTable};
use ioeye::event::{IoEvent, WIRE_SIZE};
use ioeye::probe::RequestId;
use ioeye::tracer::IoTracer;
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

fn policy_strategy() -> impl Strategy<Value = BeginPolicy> {
    prop_oneof![
        Just(BeginPolicy::Overwrite),
        Just(BeginPolicy::Reject),
        Just(BeginPolicy::Version),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_totals_equal_sum_of_durations(
        ops in prop::collection::vec((1u32..5, any::<bool>(), 0u64..1_000_000), 1..60)
    ) {
        let clock = Arc::new(ManualClock::new(0));
        let tasks = Arc::new(ManualTasks::new(Task::new(1, 1, "init")));
        let (tracer, events) =
            IoTracer::init(&TracerConfig::default(), clock.clone(), tasks.clone()).unwrap();

        let mut expected: HashMap<u32, (u64, u64)> = HashMap::new();
        let mut now = 0u64;
        for (pid, is_write, duration) in &ops {
            tasks.set(Task::new(*pid, *pid, "worker"));
            clock.set(now);
            if *is_write { tracer.vfs_write_entry() } else { tracer.vfs_read_entry() }
            now += duration;
            clock.set(now);
            if *is_write { tracer.vfs_write_exit(1) } else { tracer.vfs_read_exit(1) }

            let entry = expected.entry(*pid).or_default();
            if *is_write { entry.1 += duration } else { entry.0 += duration }
        }

        for (pid, (read_ns, write_ns)) in &expected {
            let acc = tracer.latency_for(*pid).unwrap();
            prop_assert_eq!(acc.total_read_ns, *read_ns);
            prop_assert_eq!(acc.total_write_ns, *write_ns);
        }

        let emitted = events.drain(ops.len() + 1);
        prop_assert_eq!(emitted.len(), ops.len());
        prop_assert!(emitted.iter().all(|e| e.io_end >= e.io_start));
    }

    #[test]
    fn prop_unmatched_completion_changes_nothing(rqs in prop::collection::vec(any::<u64>(), 1..50)) {
        let clock = Arc::new(ManualClock::new(0));
        let tasks = Arc::new(ManualTasks::new(Task::new(1, 1, "init")));
        let (tracer, events) =
            IoTracer::init(&TracerConfig::default(), clock, tasks).unwrap();

        for rq in &rqs {
            tracer.block_rq_complete(RequestId(*rq));
        }

        prop_assert!(events.is_empty());
        prop_assert!(tracer.latency_snapshot().is_empty());
        prop_assert_eq!(tracer.stats().block.missed, rqs.len() as u64);
    }

    #[test]
    fn prop_occupancy_bounded_by_capacity(
        capacity in 1usize..32,
        policy in policy_strategy(),
        keys in prop::collection::vec(0u8..64, 0..200),
        ends in prop::collection::vec(0u8..64, 0..50),
    ) {
        let table: CorrelationTable<u8, usize> = CorrelationTable::new(capacity, policy);

        for (i, key) in keys.iter().enumerate() {
            table.begin(*key, i);
            prop_assert!(table.stats().pending <= capacity);
        }
        for key in &ends {
            table.end(key);
        }

        let stats = table.stats();
        prop_assert!(stats.pending <= capacity);
        prop_assert_eq!(
            stats.inserted + stats.versioned,
            stats.matched + stats.pending as u64
        );
    }

    #[test]
    fn prop_wire_decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..200)) {
        if let Ok(event) = IoEvent::from_wire(&bytes) {
            prop_assert!(bytes.len() >= WIRE_SIZE);
            prop_assert!(event.comm.as_str().len() <= 16);
        }
    }
}
