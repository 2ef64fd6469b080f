//! Instrumentation point protocol
//!
//! Every start/end pair runs the same two-state protocol per identity:
//!
//! ```text
//!   no-pending ──start──▶ pending ──finish──▶ completed (record removed)
//!        │                   │
//!        └──finish (miss)──▶ no-op          never finished ⇒ orphan
//! ```
//!
//! [`Probe`] implements it once, generic over the identity type. The tracer
//! instantiates it three times: block requests keyed by [`RequestId`], and
//! VFS reads and writes keyed by [`CallContext`]. The pairs differ only in
//! key space and in how the operation kind is derived.

use crate::clock::Task;
use crate::correlation::{BeginOutcome, BeginPolicy, CorrelationTable, TableStats};
use crate::event::{Comm, DiskName, IoEvent, IoMode, OperationKind};
use std::hash::Hash;

/// Low bits of `cmd_flags` holding the request op (`REQ_OP_BITS` = 8)
pub const REQ_OP_MASK: u32 = (1 << 8) - 1;

/// Opaque identity of an in-flight block request (the request's address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// Identity of a synchronous call in flight on one thread (packed pid_tgid)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallContext(pub u64);

impl CallContext {
    pub fn of(task: &Task) -> Self {
        Self(task.pid_tgid())
    }
}

/// Direction of a block request from its `cmd_flags`
///
/// Odd op codes move data to the device, as `op_is_write` decides in the
/// kernel. Everything else counts as a read.
pub fn block_operation(cmd_flags: u32) -> OperationKind {
    if (cmd_flags & REQ_OP_MASK) & 1 == 1 {
        OperationKind::Write
    } else {
        OperationKind::Read
    }
}

/// An operation between its observed start and its observed completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOperation {
    pub start_ts: u64,
    pub pid: u32,
    pub tid: u32,
    pub comm: Comm,
    pub disk: DiskName,
    pub kind: OperationKind,
    pub io_type: Option<IoMode>,
}

impl PendingOperation {
    pub fn started_by(task: &Task, start_ts: u64, kind: OperationKind) -> Self {
        Self {
            start_ts,
            pid: task.pid,
            tid: task.tid,
            comm: task.comm,
            disk: DiskName::default(),
            kind,
            io_type: None,
        }
    }

    pub fn on_disk(mut self, disk: &str) -> Self {
        self.disk = DiskName::new(disk);
        self
    }

    pub fn with_io_type(mut self, io_type: IoMode) -> Self {
        self.io_type = Some(io_type);
        self
    }

    /// Time spent pending as of `now`
    pub fn age_ns(&self, now: u64) -> u64 {
        now.saturating_sub(self.start_ts)
    }
}

/// A pending record matched with its end hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub pending: PendingOperation,
    pub end_ts: u64,
    pub bytes: u64,
}

impl Completion {
    pub fn duration_ns(&self) -> u64 {
        self.end_ts.saturating_sub(self.pending.start_ts)
    }

    pub fn to_event(&self) -> IoEvent {
        let p = &self.pending;
        IoEvent {
            ts: p.start_ts,
            pid: p.pid,
            tid: p.tid,
            io_start: p.start_ts,
            io_end: self.end_ts,
            bytes: self.bytes,
            comm: p.comm,
            disk: p.disk,
            operation: p.kind,
            io_type: p.io_type,
        }
    }
}

/// One start/end instrumentation pair
#[derive(Debug)]
pub struct Probe<K: Eq + Hash> {
    name: &'static str,
    table: CorrelationTable<K, PendingOperation>,
}

impl<K> Probe<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new(name: &'static str, capacity: usize, policy: BeginPolicy) -> Self {
        Self {
            name,
            table: CorrelationTable::new(capacity, policy),
        }
    }

    /// Start hook: park the operation under `key`
    pub fn start(&self, key: K, pending: PendingOperation) -> BeginOutcome {
        let outcome = self.table.begin(key.clone(), pending);
        match outcome {
            BeginOutcome::Dropped => {
                tracing::debug!(probe = self.name, ?key, "correlation table full, operation untracked")
            }
            BeginOutcome::Replaced | BeginOutcome::Rejected => {
                tracing::trace!(probe = self.name, ?key, ?outcome, "identity reused while pending")
            }
            _ => {}
        }
        outcome
    }

    /// End hook: take the pending record for `key` and stamp its completion
    pub fn finish(&self, key: &K, end_ts: u64, bytes: u64) -> Option<Completion> {
        match self.table.end(key) {
            Some(pending) => Some(Completion {
                pending,
                end_ts,
                bytes,
            }),
            None => {
                tracing::trace!(probe = self.name, ?key, "completion without pending start");
                None
            }
        }
    }

    /// Evict pending records that started more than `max_age_ns` before `now`
    pub fn evict_older_than(&self, now: u64, max_age_ns: u64) -> usize {
        self.table
            .sweep(|pending| pending.age_ns(now) > max_age_ns)
    }

    pub fn clear(&self) -> usize {
        self.table.clear()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn pending(&self) -> usize {
        self.table.len()
    }

    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }
}
