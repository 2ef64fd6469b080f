//! Tracer host: owns the correlation state and exposes the hook entry points
//!
//! Whatever attaches to the kernel (or replays a recorded hook log) calls
//! [`IoTracer::init`] before the first hook fires and [`IoTracer::shutdown`]
//! after the last one. In between, the six hook methods may be called from
//! any number of threads at once. None of them blocks or fails: lookups that
//! miss, full tables and a full event channel all degrade to lost data and
//! show up in [`TracerStats`].
//!
//! Completion path for every matched pair:
//!
//! 1. compute `duration = end_ts - start_ts`
//! 2. fold it into the pid's [`LatencyAccumulator`]
//! 3. publish an [`IoEvent`](crate::event::IoEvent) (may be dropped)
//!
//! Aggregation happens before publishing, so a dropped event never loses
//! its contribution to the per-process totals.

use crate::aggregator::{LatencyAccumulator, LatencyAggregator};
use crate::clock::{Clock, MonotonicClock, OsTasks, TaskSource};
use crate::config::{ConfigError, TracerConfig};
use crate::emitter::{self, EmitterStats, EventEmitter, EventReceiver};
use crate::event::{IoMode, OperationKind};
use crate::filter::TaskFilter;
use crate::probe::{
    block_operation, CallContext, Completion, PendingOperation, Probe, RequestId,
};
use crate::correlation::TableStats;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TracerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn orphan reaper thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TracerError>;

/// Counters across every component of a tracer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TracerStats {
    pub block: TableStats,
    pub vfs_read: TableStats,
    pub vfs_write: TableStats,
    pub events: EmitterStats,
    pub aggregated_pids: usize,
    pub aggregator_dropped: u64,
    /// Start hooks skipped by the task filter
    pub filtered: u64,
}

impl TracerStats {
    /// Matched start/end pairs across all probes
    pub fn completed(&self) -> u64 {
        self.block.matched + self.vfs_read.matched + self.vfs_write.matched
    }

    /// Operations still pending across all probes
    pub fn pending(&self) -> usize {
        self.block.pending + self.vfs_read.pending + self.vfs_write.pending
    }
}

struct Inner<C, T> {
    clock: C,
    tasks: T,
    filter: TaskFilter,
    block: Probe<RequestId>,
    vfs_read: Probe<CallContext>,
    vfs_write: Probe<CallContext>,
    aggregator: LatencyAggregator,
    emitter: EventEmitter,
    orphan_max_age_ns: Option<u64>,
    filtered: AtomicU64,
}

impl<C: Clock, T: TaskSource> Inner<C, T> {
    fn call_entry(&self, probe: &Probe<CallContext>, kind: OperationKind) {
        let task = self.tasks.current();
        if !self.filter.should_trace(&task) {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // The caller sits in the syscall for the whole measured interval
        let pending = PendingOperation::started_by(&task, self.clock.now_ns(), kind)
            .with_io_type(IoMode::Sync);
        probe.start(CallContext::of(&task), pending);
    }

    fn call_exit(&self, probe: &Probe<CallContext>, ret: i64) {
        let end_ts = self.clock.now_ns();
        let key = CallContext::of(&self.tasks.current());
        // Negative returns are errnos; the call still took time
        let bytes = u64::try_from(ret).unwrap_or(0);

        if let Some(done) = probe.finish(&key, end_ts, bytes) {
            self.complete(done);
        }
    }

    fn complete(&self, done: Completion) {
        let duration = done.duration_ns();
        self.aggregator
            .record_completion(done.pending.pid, duration, done.pending.kind, done.bytes);
        self.emitter.publish(done.to_event());
    }

    fn evict_older_than(&self, max_age_ns: u64) -> usize {
        let now = self.clock.now_ns();
        let evicted = self.block.evict_older_than(now, max_age_ns)
            + self.vfs_read.evict_older_than(now, max_age_ns)
            + self.vfs_write.evict_older_than(now, max_age_ns);
        if evicted > 0 {
            tracing::debug!(evicted, max_age_ns, "evicted orphaned pending operations");
        }
        evicted
    }

    fn stats(&self) -> TracerStats {
        TracerStats {
            block: self.block.stats(),
            vfs_read: self.vfs_read.stats(),
            vfs_write: self.vfs_write.stats(),
            events: self.emitter.stats(),
            aggregated_pids: self.aggregator.len(),
            aggregator_dropped: self.aggregator.dropped(),
            filtered: self.filtered.load(Ordering::Relaxed),
        }
    }
}

/// Nanoseconds in `d`, clamped to `u64::MAX` (about 584 years)
fn saturating_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

/// Background thread evicting orphaned pending records
struct Reaper {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl Reaper {
    fn spawn<C, T>(inner: Arc<Inner<C, T>>, interval: Duration, max_age_ns: u64) -> Result<Self>
    where
        C: Clock + 'static,
        T: TaskSource + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let handle = thread::Builder::new()
            .name("ioeye-reaper".to_string())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::SeqCst) {
                    thread::park_timeout(interval);
                    if shutdown_clone.load(Ordering::SeqCst) {
                        break;
                    }
                    inner.evict_older_than(max_age_ns);
                }
            })
            .map_err(TracerError::Spawn)?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Block and VFS I/O latency tracer
///
/// # Example
///
/// ```
/// use ioeye::clock::{ManualClock, ManualTasks, Task};
/// use ioeye::config::TracerConfig;
/// use ioeye::probe::RequestId;
/// use ioeye::tracer::IoTracer;
/// use std::sync::Arc;
///
/// let clock = Arc::new(ManualClock::new(100));
/// let tasks = Arc::new(ManualTasks::new(Task::new(7, 7, "fio")));
/// let (tracer, events) =
///     IoTracer::init(&TracerConfig::default(), clock.clone(), tasks.clone()).unwrap();
///
/// tracer.block_rq_issue(RequestId(0xffff_8880_1234_0000), 0, "nvme0n1");
/// clock.set(350);
/// tracer.block_rq_complete(RequestId(0xffff_8880_1234_0000));
///
/// let event = events.try_recv().unwrap();
/// assert_eq!(event.duration_ns(), 250);
/// assert_eq!(tracer.latency_for(7).unwrap().total_read_ns, 250);
/// tracer.shutdown();
/// ```
pub struct IoTracer<C = MonotonicClock, T = OsTasks>
where
    C: Clock + 'static,
    T: TaskSource + 'static,
{
    inner: Arc<Inner<C, T>>,
    reaper: Option<Reaper>,
}

impl IoTracer<MonotonicClock, OsTasks> {
    /// Tracer reading `CLOCK_MONOTONIC` and the calling thread's identity
    pub fn init_live(config: &TracerConfig) -> Result<(Self, EventReceiver)> {
        Self::init(config, MonotonicClock::new(), OsTasks::new())
    }
}

impl<C, T> IoTracer<C, T>
where
    C: Clock + 'static,
    T: TaskSource + 'static,
{
    /// Build all tracer state. Call before attaching any hook.
    pub fn init(config: &TracerConfig, clock: C, tasks: T) -> Result<(Self, EventReceiver)> {
        config.validate()?;

        let (emitter, receiver) = emitter::channel(config.event_capacity);
        let policy = config.begin_policy;
        let orphan_max_age_ns = config.orphan_max_age().map(saturating_nanos);

        let inner = Arc::new(Inner {
            clock,
            tasks,
            filter: config.task_filter()?,
            block: Probe::new("block", config.request_capacity, policy),
            vfs_read: Probe::new("vfs_read", config.call_capacity, policy),
            vfs_write: Probe::new("vfs_write", config.call_capacity, policy),
            aggregator: LatencyAggregator::new(config.aggregator_capacity),
            emitter,
            orphan_max_age_ns,
            filtered: AtomicU64::new(0),
        });

        let reaper = match (config.sweep_interval(), orphan_max_age_ns) {
            (Some(interval), Some(max_age_ns)) => {
                Some(Reaper::spawn(inner.clone(), interval, max_age_ns)?)
            }
            _ => None,
        };

        tracing::info!(
            request_capacity = config.request_capacity,
            call_capacity = config.call_capacity,
            aggregator_capacity = config.aggregator_capacity,
            event_capacity = config.event_capacity,
            policy = ?policy,
            reaper = reaper.is_some(),
            "io tracer initialized"
        );

        Ok((Self { inner, reaper }, receiver))
    }

    /// Block request handed to the device driver
    pub fn block_rq_issue(&self, rq: RequestId, cmd_flags: u32, disk: &str) {
        let inner = &*self.inner;
        let task = inner.tasks.current();
        if !inner.filter.should_trace(&task) {
            inner.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let pending =
            PendingOperation::started_by(&task, inner.clock.now_ns(), block_operation(cmd_flags))
                .on_disk(disk);
        inner.block.start(rq, pending);
    }

    /// Block request completed by the device
    pub fn block_rq_complete(&self, rq: RequestId) {
        let inner = &*self.inner;
        let end_ts = inner.clock.now_ns();
        if let Some(done) = inner.block.finish(&rq, end_ts, 0) {
            inner.complete(done);
        }
    }

    pub fn vfs_read_entry(&self) {
        self.inner.call_entry(&self.inner.vfs_read, OperationKind::Read);
    }

    /// `ret` is the syscall return: bytes read, or a negative errno
    pub fn vfs_read_exit(&self, ret: i64) {
        self.inner.call_exit(&self.inner.vfs_read, ret);
    }

    pub fn vfs_write_entry(&self) {
        self.inner.call_entry(&self.inner.vfs_write, OperationKind::Write);
    }

    /// `ret` is the syscall return: bytes written, or a negative errno
    pub fn vfs_write_exit(&self, ret: i64) {
        self.inner.call_exit(&self.inner.vfs_write, ret);
    }

    pub fn latency_for(&self, pid: u32) -> Option<LatencyAccumulator> {
        self.inner.aggregator.get(pid)
    }

    pub fn latency_snapshot(&self) -> BTreeMap<u32, LatencyAccumulator> {
        self.inner.aggregator.snapshot()
    }

    /// Take the accumulated totals, restarting aggregation from zero
    pub fn drain_latency(&self) -> BTreeMap<u32, LatencyAccumulator> {
        self.inner.aggregator.drain()
    }

    /// Evict orphans using the configured `orphan_max_age_ms` (no-op if unset)
    pub fn sweep_orphans(&self) -> usize {
        match self.inner.orphan_max_age_ns {
            Some(max_age_ns) => self.inner.evict_older_than(max_age_ns),
            None => 0,
        }
    }

    /// Evict every pending operation older than `max_age`
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        self.inner.evict_older_than(saturating_nanos(max_age))
    }

    pub fn stats(&self) -> TracerStats {
        self.inner.stats()
    }

    /// Whether the event channel has no room left
    pub fn event_queue_full(&self) -> bool {
        self.inner.emitter.is_full()
    }

    /// Stop the reaper and release pending state. Call after detaching hooks.
    pub fn shutdown(mut self) -> TracerStats {
        if let Some(mut reaper) = self.reaper.take() {
            reaper.stop();
        }

        let stats = self.inner.stats();
        let orphans =
            self.inner.block.clear() + self.inner.vfs_read.clear() + self.inner.vfs_write.clear();

        tracing::info!(
            completed = stats.completed(),
            orphans,
            pids = stats.aggregated_pids,
            "io tracer shut down"
        );
        if stats.events.dropped > 0 {
            tracing::warn!(
                dropped = stats.events.dropped,
                drop_rate = stats.events.drop_rate(),
                "events were dropped; consider raising event_capacity"
            );
        }
        stats
    }
}
