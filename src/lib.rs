//! ioeye - per-process block and VFS I/O latency tracing
//!
//! Start and end hooks for block requests and VFS reads/writes are paired in
//! bounded correlation tables. Every matched pair is folded into a per-pid
//! latency aggregate and published as an [`event::IoEvent`] on a lossy,
//! non-blocking channel. Hooks never block and never fail: when a table or
//! queue is full the work is dropped and counted.

pub mod aggregator;
pub mod cli;
pub mod clock;
pub mod config;
pub mod correlation;
pub mod emitter;
pub mod event;
pub mod filter;
pub mod probe;
pub mod replay;
pub mod report;
pub mod tracer;
