//! Clock source and current-task accessors
//!
//! The correlation engine never reads time or process identity directly. It
//! goes through the [`Clock`] and [`TaskSource`] traits so that the same hook
//! code runs against the live system ([`MonotonicClock`], [`OsTasks`]) or
//! against scripted values ([`ManualClock`], [`ManualTasks`]) during replay
//! and in tests.
//!
//! # Clock requirements
//!
//! Durations are computed as `end - start` where both timestamps may be taken
//! on different CPUs. The clock must therefore be a single global monotonic
//! source. `CLOCK_MONOTONIC` is the same source the kernel exposes to tracing
//! programs as `bpf_ktime_get_ns`, so timestamps from both worlds compare.

use crate::event::Comm;
use crossbeam::atomic::AtomicCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic nanosecond timestamp source
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds. Must never go backwards.
    fn now_ns(&self) -> u64;
}

/// `CLOCK_MONOTONIC` backed clock
///
/// A failed clock read yields `0` instead of an error; hooks build their
/// records with the sentinel rather than aborting.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        use nix::time::{clock_gettime, ClockId};

        match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(ts) => (ts.tv_sec() as u64)
                .saturating_mul(1_000_000_000)
                .saturating_add(ts.tv_nsec() as u64),
            Err(_) => 0,
        }
    }
}

/// Settable clock for replay and tests
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub const fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    /// Jump to an absolute timestamp
    pub fn set(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    /// Move forward by `delta_ns`, returning the new time
    pub fn advance(&self, delta_ns: u64) -> u64 {
        self.now.fetch_add(delta_ns, Ordering::SeqCst) + delta_ns
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_ns(&self) -> u64 {
        (**self).now_ns()
    }
}

/// Identity of the execution context a hook fires in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Task {
    pub pid: u32,
    pub tid: u32,
    pub comm: Comm,
}

impl Task {
    pub fn new(pid: u32, tid: u32, comm: &str) -> Self {
        Self {
            pid,
            tid,
            comm: Comm::new(comm),
        }
    }

    /// Packed `(pid << 32) | tid`, the layout of `bpf_get_current_pid_tgid`
    pub fn pid_tgid(&self) -> u64 {
        ((self.pid as u64) << 32) | self.tid as u64
    }
}

/// Accessor for the task currently executing a hook
pub trait TaskSource: Send + Sync {
    fn current(&self) -> Task;
}

impl<S: TaskSource + ?Sized> TaskSource for std::sync::Arc<S> {
    fn current(&self) -> Task {
        (**self).current()
    }
}

/// Task identity of the calling OS thread
///
/// Pid and tid come from `getpid`/`gettid`; the name is the thread name as
/// reported by `PR_GET_NAME`. An unreadable name yields an empty comm.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsTasks;

impl OsTasks {
    pub fn new() -> Self {
        Self
    }
}

impl TaskSource for OsTasks {
    fn current(&self) -> Task {
        let pid = nix::unistd::getpid().as_raw() as u32;

        #[cfg(target_os = "linux")]
        let (tid, comm) = {
            let tid = nix::unistd::gettid().as_raw() as u32;
            let comm = nix::sys::prctl::get_name()
                .map(|name| Comm::new(&name.to_string_lossy()))
                .unwrap_or_default();
            (tid, comm)
        };

        #[cfg(not(target_os = "linux"))]
        let (tid, comm) = (pid, Comm::default());

        Task { pid, tid, comm }
    }
}

/// Settable task source for replay and tests
#[derive(Debug, Default)]
pub struct ManualTasks {
    current: AtomicCell<Task>,
}

impl ManualTasks {
    pub fn new(task: Task) -> Self {
        Self {
            current: AtomicCell::new(task),
        }
    }

    pub fn set(&self, task: Task) {
        self.current.store(task);
    }
}

impl TaskSource for ManualTasks {
    fn current(&self) -> Task {
        self.current.load()
    }
}
