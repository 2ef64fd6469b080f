//! Per-process latency aggregation
//!
//! Every matched operation folds its duration into the running totals of the
//! issuing pid. Accumulators are created lazily on the first completion for a
//! pid and live until the tracer shuts down or a consumer drains them.

use crate::event::OperationKind;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Running latency totals for one process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencyAccumulator {
    pub total_read_ns: u64,
    pub count_read: u64,
    pub total_write_ns: u64,
    pub count_write: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl LatencyAccumulator {
    fn add(&mut self, duration_ns: u64, kind: OperationKind, bytes: u64) {
        match kind {
            OperationKind::Read => {
                self.total_read_ns = self.total_read_ns.saturating_add(duration_ns);
                self.count_read = self.count_read.saturating_add(1);
                self.bytes_read = self.bytes_read.saturating_add(bytes);
            }
            OperationKind::Write => {
                self.total_write_ns = self.total_write_ns.saturating_add(duration_ns);
                self.count_write = self.count_write.saturating_add(1);
                self.bytes_written = self.bytes_written.saturating_add(bytes);
            }
        }
    }

    /// Mean read latency, 0 when no reads were seen
    pub fn avg_read_ns(&self) -> u64 {
        self.total_read_ns.checked_div(self.count_read).unwrap_or(0)
    }

    /// Mean write latency, 0 when no writes were seen
    pub fn avg_write_ns(&self) -> u64 {
        self.total_write_ns.checked_div(self.count_write).unwrap_or(0)
    }

    pub fn total_ops(&self) -> u64 {
        self.count_read.saturating_add(self.count_write)
    }

    /// Growth since an earlier snapshot of the same pid
    pub fn since(&self, earlier: &LatencyAccumulator) -> LatencyAccumulator {
        LatencyAccumulator {
            total_read_ns: self.total_read_ns.saturating_sub(earlier.total_read_ns),
            count_read: self.count_read.saturating_sub(earlier.count_read),
            total_write_ns: self.total_write_ns.saturating_sub(earlier.total_write_ns),
            count_write: self.count_write.saturating_sub(earlier.count_write),
            bytes_read: self.bytes_read.saturating_sub(earlier.bytes_read),
            bytes_written: self.bytes_written.saturating_sub(earlier.bytes_written),
        }
    }
}

/// Bounded pid → [`LatencyAccumulator`] map
///
/// A pid first seen while the map is full is not tracked; the completion is
/// counted in [`dropped`](Self::dropped) and otherwise ignored.
#[derive(Debug)]
pub struct LatencyAggregator {
    by_pid: DashMap<u32, LatencyAccumulator>,
    capacity: usize,
    occupancy: AtomicUsize,
    dropped: AtomicU64,
}

impl LatencyAggregator {
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Aggregator capacity must be > 0");

        Self {
            by_pid: DashMap::with_capacity(capacity),
            capacity,
            occupancy: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Fold one completed operation of unknown size into `pid`'s totals
    pub fn record(&self, pid: u32, duration_ns: u64, kind: OperationKind) {
        self.record_completion(pid, duration_ns, kind, 0);
    }

    /// Fold one completed operation into `pid`'s totals
    pub fn record_completion(&self, pid: u32, duration_ns: u64, kind: OperationKind, bytes: u64) {
        if let Some(mut acc) = self.by_pid.get_mut(&pid) {
            acc.add(duration_ns, kind, bytes);
            return;
        }

        // Capacity is checked under the shard lock so two racing first
        // completions for one pid reserve a single slot.
        let mut entry = match self.by_pid.entry(pid) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.into_ref(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let reserved = self
                    .occupancy
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < self.capacity).then_some(n + 1)
                    })
                    .is_ok();
                if !reserved {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(pid, "latency aggregator full, completion not aggregated");
                    return;
                }
                vacant.insert(LatencyAccumulator::default())
            }
        };
        entry.add(duration_ns, kind, bytes);
    }

    pub fn get(&self, pid: u32) -> Option<LatencyAccumulator> {
        self.by_pid.get(&pid).map(|acc| *acc)
    }

    /// Copy of every accumulator, ordered by pid
    pub fn snapshot(&self) -> BTreeMap<u32, LatencyAccumulator> {
        self.by_pid
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Take every accumulator, leaving the map empty
    pub fn drain(&self) -> BTreeMap<u32, LatencyAccumulator> {
        let mut drained = BTreeMap::new();
        self.by_pid.retain(|pid, acc| {
            drained.insert(*pid, *acc);
            false
        });
        self.occupancy.fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }

    /// Number of pids tracked
    pub fn len(&self) -> usize {
        self.occupancy.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Completions lost because their pid did not fit
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
