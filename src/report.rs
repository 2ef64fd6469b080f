//! Rates and summaries derived from aggregator snapshots
//!
//! Accumulators only grow, so IOPS and throughput come from the difference of
//! two snapshots over the time between them.

use crate::aggregator::LatencyAccumulator;
use crate::event::{IoEvent, OperationKind};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;

/// Intervals shorter than this are treated as one second
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Per-process I/O rates over one interval
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct IoRates {
    pub read_iops: f64,
    pub write_iops: f64,
    pub read_bytes_per_sec: f64,
    pub write_bytes_per_sec: f64,
    /// Mean latency of reads completed within the interval
    pub avg_read_latency_ns: u64,
    pub avg_write_latency_ns: u64,
}

impl IoRates {
    pub fn total_iops(&self) -> f64 {
        self.read_iops + self.write_iops
    }

    pub fn total_bytes_per_sec(&self) -> f64 {
        self.read_bytes_per_sec + self.write_bytes_per_sec
    }

    fn from_delta(delta: &LatencyAccumulator, secs: f64) -> Self {
        Self {
            read_iops: delta.count_read as f64 / secs,
            write_iops: delta.count_write as f64 / secs,
            read_bytes_per_sec: delta.bytes_read as f64 / secs,
            write_bytes_per_sec: delta.bytes_written as f64 / secs,
            avg_read_latency_ns: delta.avg_read_ns(),
            avg_write_latency_ns: delta.avg_write_ns(),
        }
    }
}

/// Rates for every pid present in `current`
///
/// Pids missing from `previous` are measured from zero.
pub fn rates_between(
    previous: &BTreeMap<u32, LatencyAccumulator>,
    current: &BTreeMap<u32, LatencyAccumulator>,
    elapsed: Duration,
) -> BTreeMap<u32, IoRates> {
    let secs = if elapsed < MIN_INTERVAL {
        1.0
    } else {
        elapsed.as_secs_f64()
    };

    current
        .iter()
        .map(|(pid, acc)| {
            let delta = match previous.get(pid) {
                Some(earlier) => acc.since(earlier),
                None => *acc,
            };
            (*pid, IoRates::from_delta(&delta, secs))
        })
        .collect()
}

/// Column header matching [`format_event`]
pub const EVENT_HEADER: &str =
    "TIME(ns)             COMM             PID     TID     T DISK         BYTES   LAT(us)";

/// One event as a fixed-width text row
pub fn format_event(event: &IoEvent) -> String {
    let direction = match event.operation {
        OperationKind::Read => 'R',
        OperationKind::Write => 'W',
    };
    let disk = if event.disk.is_empty() {
        "-"
    } else {
        event.disk.as_str()
    };
    format!(
        "{:<20} {:<16} {:<7} {:<7} {} {:<8} {:>9} {:>9.3}",
        event.io_end,
        event.comm.as_str(),
        event.pid,
        event.tid,
        direction,
        disk,
        event.bytes,
        event.duration_ns() as f64 / 1_000.0,
    )
}

/// Text table of per-process totals, one row per pid
pub fn render_summary(snapshot: &BTreeMap<u32, LatencyAccumulator>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>8} {:>10} {:>14} {:>12} {:>10} {:>14} {:>12}",
        "PID", "READS", "AVG READ us", "READ KiB", "WRITES", "AVG WRITE us", "WRITE KiB"
    );

    for (pid, acc) in snapshot {
        let _ = writeln!(
            out,
            "{:>8} {:>10} {:>14.3} {:>12} {:>10} {:>14.3} {:>12}",
            pid,
            acc.count_read,
            acc.avg_read_ns() as f64 / 1_000.0,
            acc.bytes_read / 1024,
            acc.count_write,
            acc.avg_write_ns() as f64 / 1_000.0,
            acc.bytes_written / 1024,
        );
    }

    let total_ops: u64 = snapshot.values().map(LatencyAccumulator::total_ops).sum();
    let _ = writeln!(out, "{} processes, {} operations", snapshot.len(), total_ops);
    out
}

/// Text table of per-process rates, one row per pid
pub fn render_rates(rates: &BTreeMap<u32, IoRates>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>8} {:>12} {:>12} {:>14} {:>14}",
        "PID", "READ IOPS", "WRITE IOPS", "READ KiB/s", "WRITE KiB/s"
    );

    for (pid, r) in rates {
        let _ = writeln!(
            out,
            "{:>8} {:>12.1} {:>12.1} {:>14.1} {:>14.1}",
            pid,
            r.read_iops,
            r.write_iops,
            r.read_bytes_per_sec / 1024.0,
            r.write_bytes_per_sec / 1024.0,
        );
    }
    out
}
