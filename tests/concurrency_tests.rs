//! Concurrent hook stress tests
//!
//! Many threads drive start/end pairs on disjoint identities at once. Each
//! thread's pairs must match exactly, and the shared aggregates must equal
//! the sum of the per-thread work.

use ioeye::aggregator::LatencyAggregator;
use ioeye::clock::{Clock, ManualClock, ManualTasks, Task, TaskSource};
use ioeye::config::TracerConfig;
use ioeye::correlation::{BeginOutcome, BeginPolicy, CorrelationTable};
use ioeye::event::OperationKind;
use ioeye::tracer::IoTracer;
use std::sync::Arc;
use std::thread;

const THREADS: u64 = 8;
const PER_THREAD: u64 = 1_000;

#[test]
fn test_disjoint_keys_never_interfere() {
    let table: Arc<CorrelationTable<u64, u64>> =
        Arc::new(CorrelationTable::new(1024, BeginPolicy::Overwrite));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let key = t * PER_THREAD + i;
                    // Record value encodes the key so a crossed match would show
                    assert_eq!(table.begin(key, key * 10), BeginOutcome::Inserted);
                    assert_eq!(table.end(&key), Some(key * 10));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let stats = table.stats();
    assert_eq!(stats.inserted, THREADS * PER_THREAD);
    assert_eq!(stats.matched, THREADS * PER_THREAD);
    assert_eq!(stats.dropped, 0);
    assert!(table.is_empty());
}

#[test]
fn test_capacity_holds_under_contention() {
    let table: Arc<CorrelationTable<u64, ()>> =
        Arc::new(CorrelationTable::new(100, BeginPolicy::Overwrite));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                (0..PER_THREAD)
                    .filter(|i| table.begin(t * PER_THREAD + i, ()) == BeginOutcome::Inserted)
                    .count() as u64
            })
        })
        .collect();

    let inserted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(inserted, 100);
    assert_eq!(table.len(), 100);
    assert_eq!(table.stats().dropped, THREADS * PER_THREAD - 100);
}

#[test]
fn test_aggregator_sums_concurrent_records() {
    let aggregator = Arc::new(LatencyAggregator::new(16));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let aggregator = aggregator.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let kind = if i % 2 == 0 {
                        OperationKind::Read
                    } else {
                        OperationKind::Write
                    };
                    // Two pids shared by all threads
                    aggregator.record((t % 2) as u32, 10, kind);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = aggregator.snapshot();
    let total_ops: u64 = snapshot.values().map(|acc| acc.total_ops()).sum();
    assert_eq!(total_ops, THREADS * PER_THREAD);
    for acc in snapshot.values() {
        assert_eq!(acc.count_read, acc.count_write);
        assert_eq!(acc.total_read_ns, acc.count_read * 10);
    }
}

/// Each thread reports its own task identity
struct PerThreadTasks;

thread_local! {
    static CURRENT: std::cell::Cell<(u32, u32)> = const { std::cell::Cell::new((0, 0)) };
}

impl TaskSource for PerThreadTasks {
    fn current(&self) -> Task {
        let (pid, tid) = CURRENT.with(|c| c.get());
        Task::new(pid, tid, "worker")
    }
}

#[test]
fn test_tracer_totals_match_emitted_events() {
    let config = TracerConfig {
        event_capacity: (THREADS * PER_THREAD) as usize,
        ..TracerConfig::default()
    };
    let clock = Arc::new(ManualClock::new(0));
    let (tracer, events) = IoTracer::init(&config, clock.clone(), PerThreadTasks).unwrap();
    let tracer = Arc::new(tracer);

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tracer = tracer.clone();
            let clock = clock.clone();
            thread::spawn(move || {
                CURRENT.with(|c| c.set((100 + (t % 4) as u32, 1000 + t as u32)));
                for _ in 0..PER_THREAD {
                    tracer.vfs_read_entry();
                    clock.advance(1);
                    tracer.vfs_read_exit(4096);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let emitted = events.drain(usize::MAX);
    assert_eq!(emitted.len() as u64, THREADS * PER_THREAD);
    assert!(emitted.iter().all(|e| e.io_end >= e.io_start));

    let snapshot = tracer.latency_snapshot();
    for (pid, acc) in &snapshot {
        let from_events: u64 = emitted
            .iter()
            .filter(|e| e.pid == *pid)
            .map(|e| e.duration_ns())
            .sum();
        assert_eq!(acc.total_read_ns, from_events);
        assert_eq!(acc.count_read, 2 * PER_THREAD);
    }
    assert!(clock.now_ns() >= THREADS * PER_THREAD);
    assert_eq!(tracer.stats().vfs_read.missed, 0);
}

#[test]
fn test_manual_tasks_shared_across_threads() {
    let tasks = Arc::new(ManualTasks::new(Task::new(1, 1, "init")));
    let setter = {
        let tasks = tasks.clone();
        thread::spawn(move || tasks.set(Task::new(2, 3, "worker")))
    };
    setter.join().unwrap();
    assert_eq!(tasks.current().pid, 2);
}
