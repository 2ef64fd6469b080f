//! Lossy, non-blocking event channel
//!
//! Completion hooks run inline with real I/O, so publishing an event must
//! never wait on the consumer. The channel is a bounded lock-free queue: when
//! it is full the new event is dropped and counted, and the hook moves on.
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ HOOK CONTEXTS (hot path, many producers)                 │
//! │   end hook → EventEmitter::publish(event)                │
//! │   full queue → drop + count, never block                 │
//! └──────────────────────────────────────────────────────────┘
//!                          │
//!                          │ crossbeam ArrayQueue<IoEvent>
//!                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ CONSUMER (cold path)                                     │
//! │   EventReceiver::drain(n)       pull it yourself, or     │
//! │   EventPump → EventSink         sidecar thread batches   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Events from one producer arrive in publish order. Events from different
//! producers interleave arbitrarily.

use crate::event::IoEvent;
use crossbeam::queue::ArrayQueue;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug)]
struct Shared {
    queue: ArrayQueue<IoEvent>,
    published: AtomicU64,
    dropped: AtomicU64,
}

/// Create a connected emitter/receiver pair holding at most `capacity` events
///
/// # Panics
///
/// Panics if capacity is 0.
pub fn channel(capacity: usize) -> (EventEmitter, EventReceiver) {
    assert!(capacity > 0, "Event channel capacity must be > 0");

    let shared = Arc::new(Shared {
        queue: ArrayQueue::new(capacity),
        published: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
    (
        EventEmitter {
            shared: shared.clone(),
        },
        EventReceiver { shared },
    )
}

/// Producer half, cheap to clone into every hook context
#[derive(Debug, Clone)]
pub struct EventEmitter {
    shared: Arc<Shared>,
}

impl EventEmitter {
    /// Hand `event` to the consumer. Returns false if it was dropped.
    pub fn publish(&self, event: IoEvent) -> bool {
        match self.shared.queue.push(event) {
            Ok(()) => {
                self.shared.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(dropped) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    pid = dropped.pid,
                    "event channel full, event dropped (backpressure)"
                );
                false
            }
        }
    }

    /// Whether the next publish would be dropped
    pub fn is_full(&self) -> bool {
        self.shared.queue.is_full()
    }

    pub fn stats(&self) -> EmitterStats {
        self.shared.stats()
    }
}

/// Consumer half
#[derive(Debug)]
pub struct EventReceiver {
    shared: Arc<Shared>,
}

impl EventReceiver {
    pub fn try_recv(&self) -> Option<IoEvent> {
        self.shared.queue.pop()
    }

    /// Pop up to `max` queued events
    pub fn drain(&self, max: usize) -> Vec<IoEvent> {
        let mut batch = Vec::with_capacity(max.min(self.shared.queue.len()));
        while batch.len() < max {
            match self.shared.queue.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.queue.is_empty()
    }

    pub fn stats(&self) -> EmitterStats {
        self.shared.stats()
    }
}

impl Shared {
    fn stats(&self) -> EmitterStats {
        EmitterStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queued: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }
}

/// Channel statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EmitterStats {
    /// Events accepted into the queue
    pub published: u64,
    /// Events lost to a full queue
    pub dropped: u64,
    pub queued: usize,
    pub capacity: usize,
}

impl EmitterStats {
    /// Fraction of publish attempts that were dropped (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        let attempts = self.published + self.dropped;
        if attempts == 0 {
            0.0
        } else {
            self.dropped as f64 / attempts as f64
        }
    }

    /// Queue fill level (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.queued as f64 / self.capacity as f64
    }
}

/// Destination for batches of events drained by an [`EventPump`]
pub trait EventSink: Send {
    fn deliver(&mut self, batch: &[IoEvent]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<F> EventSink for F
where
    F: FnMut(&[IoEvent]) + Send,
{
    fn deliver(&mut self, batch: &[IoEvent]) -> io::Result<()> {
        self(batch);
        Ok(())
    }
}

/// One JSON object per line
#[derive(Debug)]
pub struct JsonLinesSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn deliver(&mut self, batch: &[IoEvent]) -> io::Result<()> {
        for event in batch {
            serde_json::to_writer(&mut self.writer, event)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Back-to-back fixed-size wire records
#[derive(Debug)]
pub struct WireSink<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> WireSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EventSink for WireSink<W> {
    fn deliver(&mut self, batch: &[IoEvent]) -> io::Result<()> {
        for event in batch {
            self.writer.write_all(&event.to_wire())?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Human-readable lines, one per event
#[derive(Debug)]
pub struct TextSink<W: Write + Send> {
    writer: W,
    header_written: bool,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> EventSink for TextSink<W> {
    fn deliver(&mut self, batch: &[IoEvent]) -> io::Result<()> {
        if !self.header_written {
            writeln!(self.writer, "{}", crate::report::EVENT_HEADER)?;
            self.header_written = true;
        }
        for event in batch {
            writeln!(self.writer, "{}", crate::report::format_event(event))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Sidecar thread moving events from a receiver into a sink
///
/// The thread drains in batches, sleeps briefly when the queue is empty, and
/// drains whatever is left before exiting on shutdown. A failing sink loses
/// the batch it failed on; the error is logged and pumping continues.
pub struct EventPump {
    handle: Option<JoinHandle<u64>>,
    shutdown: Arc<AtomicBool>,
}

impl EventPump {
    const BATCH_SIZE: usize = 100;
    const IDLE_SLEEP: Duration = Duration::from_millis(10);

    pub fn spawn<S>(receiver: EventReceiver, sink: S) -> io::Result<Self>
    where
        S: EventSink + 'static,
    {
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let handle = thread::Builder::new()
            .name("ioeye-pump".to_string())
            .spawn(move || Self::worker(receiver, sink, shutdown_clone))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    /// Stop after draining the queue. Returns the number of events delivered.
    pub fn shutdown(mut self) -> u64 {
        self.stop()
    }

    fn stop(&mut self) -> u64 {
        self.shutdown.store(true, Ordering::SeqCst);
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(0),
            None => 0,
        }
    }

    fn worker<S: EventSink>(receiver: EventReceiver, mut sink: S, shutdown: Arc<AtomicBool>) -> u64 {
        let mut delivered = 0u64;

        loop {
            let stopping = shutdown.load(Ordering::SeqCst);
            let batch = receiver.drain(Self::BATCH_SIZE);

            if batch.is_empty() {
                if stopping {
                    break;
                }
                thread::sleep(Self::IDLE_SLEEP);
                continue;
            }

            match sink.deliver(&batch) {
                Ok(()) => delivered += batch.len() as u64,
                Err(e) => {
                    tracing::warn!(error = %e, lost = batch.len(), "event sink failed, batch discarded")
                }
            }
        }

        if let Err(e) = sink.flush() {
            tracing::warn!(error = %e, "event sink flush failed");
        }
        delivered
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}
