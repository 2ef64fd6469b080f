//! Offline driver: replay a recorded hook log through the tracer
//!
//! Each line of the log is one hook invocation as JSON, carrying the
//! timestamp and task identity the hook observed:
//!
//! ```text
//! {"hook":"block_issue","ts":100,"pid":7,"tid":7,"comm":"fio","rq":18446612682702848,"cmd_flags":1,"disk":"nvme0n1"}
//! {"hook":"block_complete","ts":350,"rq":18446612682702848}
//! {"hook":"read_entry","ts":400,"pid":7,"tid":9,"comm":"fio"}
//! {"hook":"read_exit","ts":900,"pid":7,"tid":9,"comm":"fio","ret":4096}
//! ```
//!
//! Before invoking a hook the replayer points the manual clock and task
//! source at the line's values, so the tracer sees exactly what it would
//! have seen live. Blank lines and lines starting with `#` are skipped.
//!
//! Live hooks drop events when the channel is full. A replay has no such
//! deadline: with [`Replayer::wait_for_consumer`] enabled it pauses before
//! each hook until the consumer has made room, so no event is lost.

use crate::clock::{ManualClock, ManualTasks, Task};
use crate::config::TracerConfig;
use crate::emitter::EventReceiver;
use crate::probe::RequestId;
use crate::tracer::{IoTracer, TracerError, TracerStats};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Poll period while waiting for the consumer to drain the event channel
const BACKPRESSURE_POLL: Duration = Duration::from_micros(200);

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("failed to read hook log: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: invalid hook record: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Timestamp and task identity observed by a hook
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookContext {
    pub ts: u64,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub tid: u32,
    #[serde(default)]
    pub comm: String,
}

/// One recorded hook invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum HookRecord {
    BlockIssue {
        #[serde(flatten)]
        ctx: HookContext,
        rq: u64,
        #[serde(default)]
        cmd_flags: u32,
        #[serde(default)]
        disk: String,
    },
    BlockComplete {
        #[serde(flatten)]
        ctx: HookContext,
        rq: u64,
    },
    ReadEntry {
        #[serde(flatten)]
        ctx: HookContext,
    },
    ReadExit {
        #[serde(flatten)]
        ctx: HookContext,
        ret: i64,
    },
    WriteEntry {
        #[serde(flatten)]
        ctx: HookContext,
    },
    WriteExit {
        #[serde(flatten)]
        ctx: HookContext,
        ret: i64,
    },
}

impl HookRecord {
    pub fn context(&self) -> &HookContext {
        match self {
            HookRecord::BlockIssue { ctx, .. }
            | HookRecord::BlockComplete { ctx, .. }
            | HookRecord::ReadEntry { ctx }
            | HookRecord::ReadExit { ctx, .. }
            | HookRecord::WriteEntry { ctx }
            | HookRecord::WriteExit { ctx, .. } => ctx,
        }
    }
}

/// Outcome of replaying one log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    /// Hooks invoked
    pub hooks: u64,
    /// Blank and comment lines
    pub skipped: u64,
    /// Hooks whose timestamp went backwards relative to the previous hook
    pub out_of_order: u64,
    /// Smallest hook timestamp seen
    pub earliest_ts: u64,
    /// Largest hook timestamp seen
    pub latest_ts: u64,
}

impl ReplayStats {
    /// Time covered by the replayed hooks
    pub fn span(&self) -> Duration {
        Duration::from_nanos(self.latest_ts.saturating_sub(self.earliest_ts))
    }
}

type ReplayTracer = IoTracer<Arc<ManualClock>, Arc<ManualTasks>>;

/// Tracer wired to scripted clock and task sources
pub struct Replayer {
    clock: Arc<ManualClock>,
    tasks: Arc<ManualTasks>,
    tracer: ReplayTracer,
    last_ts: u64,
    wait_for_consumer: bool,
    stats: ReplayStats,
}

impl Replayer {
    pub fn new(config: &TracerConfig) -> Result<(Self, EventReceiver), TracerError> {
        let clock = Arc::new(ManualClock::new(0));
        let tasks = Arc::new(ManualTasks::default());
        let (tracer, events) = IoTracer::init(config, clock.clone(), tasks.clone())?;
        Ok((
            Self {
                clock,
                tasks,
                tracer,
                last_ts: 0,
                wait_for_consumer: false,
                stats: ReplayStats::default(),
            },
            events,
        ))
    }

    /// Block before each hook while the event channel is full
    ///
    /// Only enable this when something drains the receiver concurrently,
    /// such as an [`EventPump`](crate::emitter::EventPump); otherwise the
    /// replay stalls once the channel fills.
    pub fn wait_for_consumer(&mut self, enabled: bool) {
        self.wait_for_consumer = enabled;
    }

    /// Invoke the hook described by `record`
    pub fn apply(&mut self, record: &HookRecord) {
        if self.wait_for_consumer {
            while self.tracer.event_queue_full() {
                thread::sleep(BACKPRESSURE_POLL);
            }
        }

        let ctx = record.context();
        if self.stats.hooks == 0 {
            self.stats.earliest_ts = ctx.ts;
            self.stats.latest_ts = ctx.ts;
        } else {
            self.stats.earliest_ts = self.stats.earliest_ts.min(ctx.ts);
            self.stats.latest_ts = self.stats.latest_ts.max(ctx.ts);
        }
        if ctx.ts < self.last_ts {
            self.stats.out_of_order += 1;
            tracing::debug!(ts = ctx.ts, previous = self.last_ts, "hook timestamp went backwards");
        }
        self.last_ts = ctx.ts;
        self.clock.set(ctx.ts);
        self.tasks.set(Task::new(ctx.pid, ctx.tid, &ctx.comm));

        match record {
            HookRecord::BlockIssue {
                rq, cmd_flags, disk, ..
            } => self.tracer.block_rq_issue(RequestId(*rq), *cmd_flags, disk),
            HookRecord::BlockComplete { rq, .. } => self.tracer.block_rq_complete(RequestId(*rq)),
            HookRecord::ReadEntry { .. } => self.tracer.vfs_read_entry(),
            HookRecord::ReadExit { ret, .. } => self.tracer.vfs_read_exit(*ret),
            HookRecord::WriteEntry { .. } => self.tracer.vfs_write_entry(),
            HookRecord::WriteExit { ret, .. } => self.tracer.vfs_write_exit(*ret),
        }
        self.stats.hooks += 1;
    }

    /// Replay every line of `reader`, stopping at the first malformed line
    pub fn run<R: BufRead>(&mut self, reader: R) -> Result<ReplayStats, ReplayError> {
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                self.stats.skipped += 1;
                continue;
            }

            let record: HookRecord = serde_json::from_str(trimmed)
                .map_err(|source| ReplayError::Parse {
                    line: idx + 1,
                    source,
                })?;
            self.apply(&record);
        }
        Ok(self.stats)
    }

    pub fn tracer(&self) -> &ReplayTracer {
        &self.tracer
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Shut the tracer down, returning its final counters
    pub fn finish(self) -> TracerStats {
        self.tracer.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OperationKind;

    const LOG: &str = r#"
# one block request and one read
{"hook":"block_issue","ts":100,"pid":7,"tid":7,"comm":"fio","rq":18446612682702848,"cmd_flags":1,"disk":"nvme0n1"}
{"hook":"read_entry","ts":120,"pid":9,"tid":10,"comm":"cat"}
{"hook":"block_complete","ts":350,"rq":18446612682702848}
{"hook":"read_exit","ts":170,"pid":9,"tid":10,"comm":"cat","ret":512}
"#;

    #[test]
    fn test_parse_hook_record() {
        let record: HookRecord =
            serde_json::from_str(r#"{"hook":"write_exit","ts":5,"pid":1,"tid":2,"comm":"dd","ret":-28}"#)
                .unwrap();
        assert_eq!(
            record,
            HookRecord::WriteExit {
                ctx: HookContext {
                    ts: 5,
                    pid: 1,
                    tid: 2,
                    comm: "dd".to_string()
                },
                ret: -28
            }
        );
    }

    #[test]
    fn test_replay_log() {
        let (mut replayer, events) = Replayer::new(&TracerConfig::default()).unwrap();
        let stats = replayer.run(LOG.as_bytes()).unwrap();
        assert_eq!(stats.hooks, 4);
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!((stats.earliest_ts, stats.latest_ts), (100, 350));
        assert_eq!(stats.span(), Duration::from_nanos(250));

        let events = events.drain(10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].pid, 7);
        assert_eq!(events[0].operation, OperationKind::Write);
        assert_eq!(events[0].duration_ns(), 250);
        assert_eq!(events[1].pid, 9);
        assert_eq!(events[1].bytes, 512);

        let snapshot = replayer.tracer().latency_snapshot();
        assert_eq!(snapshot[&7].total_write_ns, 250);
        assert_eq!(snapshot[&9].total_read_ns, 50);
        assert_eq!(replayer.finish().completed(), 2);
    }

    #[test]
    fn test_malformed_line_reports_line_number() {
        let (mut replayer, _events) = Replayer::new(&TracerConfig::default()).unwrap();
        let log = "{\"hook\":\"read_entry\",\"ts\":1}\n{\"hook\":\"bogus\"}\n";
        match replayer.run(log.as_bytes()) {
            Err(ReplayError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    fn block_pairs(n: u64) -> String {
        (0..n)
            .map(|rq| {
                format!(
                    "{{\"hook\":\"block_issue\",\"ts\":{},\"pid\":3,\"tid\":3,\"comm\":\"dd\",\"rq\":{},\"disk\":\"sda\"}}\n\
                     {{\"hook\":\"block_complete\",\"ts\":{},\"rq\":{}}}\n",
                    rq * 10,
                    rq,
                    rq * 10 + 5,
                    rq
                )
            })
            .collect()
    }

    #[test]
    fn test_waiting_for_consumer_loses_nothing() {
        use crate::emitter::EventPump;
        use crate::event::IoEvent;

        let config = TracerConfig {
            event_capacity: 4,
            ..TracerConfig::default()
        };
        let (mut replayer, events) = Replayer::new(&config).unwrap();
        replayer.wait_for_consumer(true);
        let pump = EventPump::spawn(events, |_: &[IoEvent]| {}).unwrap();

        replayer.run(block_pairs(200).as_bytes()).unwrap();
        let stats = replayer.finish();
        assert_eq!(pump.shutdown(), 200);
        assert_eq!(stats.events.published, 200);
        assert_eq!(stats.events.dropped, 0);
    }

    #[test]
    fn test_without_waiting_full_channel_drops() {
        let config = TracerConfig {
            event_capacity: 4,
            ..TracerConfig::default()
        };
        let (mut replayer, events) = Replayer::new(&config).unwrap();
        replayer.run(block_pairs(10).as_bytes()).unwrap();

        assert_eq!(events.len(), 4);
        let stats = replayer.finish();
        assert_eq!(stats.events.dropped, 6);
        assert_eq!(stats.block.matched, 10);
    }
}
