//! Completed-operation records and their fixed binary layout
//!
//! An [`IoEvent`] is built once per matched start/end pair and never mutated
//! afterwards. Its wire form mirrors the C struct the kernel side of a tracer
//! writes into a perf buffer, so a consumer can read either source with the
//! same decoder.
//!
//! # Wire layout
//!
//! ```text
//! offset  size  field
//! ------  ----  ---------------------------------------------
//!      0     8  ts         capture timestamp (ns)
//!      8     4  pid
//!     12     4  tid
//!     16     8  io_start   (ns)
//!     24     8  io_end     (ns)
//!     32     8  bytes      0 if not observed
//!     40    16  comm       NUL padded
//!     56    32  disk       NUL padded, empty if n/a
//!     88     1  operation  0=read 1=write
//!     89     1  io_type    0=sync 1=async 0xff=unclassified
//!     90     6  padding    (struct aligned to 8)
//! ```
//!
//! Integers are native-endian, as the C struct is.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// Length of a process name, including the terminating NUL
pub const COMM_LEN: usize = 16;

/// Length of a device name, including the terminating NUL
pub const DISK_LEN: usize = 32;

/// Encoded size of one [`IoEvent`]
pub const WIRE_SIZE: usize = 96;

const IO_TYPE_UNCLASSIFIED: u8 = 0xff;

/// Errors decoding an [`IoEvent`] from its wire form
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WireError {
    #[error("event record truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid operation code: {0}")]
    InvalidOperation(u8),

    #[error("invalid io_type code: {0}")]
    InvalidIoMode(u8),
}

/// Fixed-capacity, NUL-padded string
///
/// Construction truncates to `N - 1` bytes (at a char boundary) so the
/// buffer always ends in at least one NUL, like `bpf_get_current_comm`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
}

/// Process name captured at operation start
pub type Comm = FixedStr<COMM_LEN>;

/// Block device name, empty on the VFS path
pub type DiskName = FixedStr<DISK_LEN>;

impl<const N: usize> FixedStr<N> {
    pub fn new(s: &str) -> Self {
        let mut end = s.len().min(N.saturating_sub(1));
        while !s.is_char_boundary(end) {
            end -= 1;
        }

        let mut bytes = [0u8; N];
        bytes[..end].copy_from_slice(&s.as_bytes()[..end]);
        Self { bytes }
    }

    /// Wrap raw bytes as read off the wire
    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Text up to the first NUL. Invalid UTF-8 yields the longest valid prefix.
    pub fn as_str(&self) -> &str {
        let len = self.bytes.iter().position(|&b| b == 0).unwrap_or(N);
        match std::str::from_utf8(&self.bytes[..len]) {
            Ok(s) => s,
            Err(e) => {
                // Prefix up to valid_up_to() is valid UTF-8 by definition
                std::str::from_utf8(&self.bytes[..e.valid_up_to()]).unwrap_or_default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes[0] == 0
    }
}

impl<const N: usize> Default for FixedStr<N> {
    fn default() -> Self {
        Self { bytes: [0u8; N] }
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> fmt::Display for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<const N: usize> Serialize for FixedStr<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de, const N: usize> Deserialize<'de> for FixedStr<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::new(&s))
    }
}

/// Direction of an I/O operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum OperationKind {
    Read = 0,
    Write = 1,
}

impl OperationKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(OperationKind::Read),
            1 => Some(OperationKind::Write),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Read => "read",
            OperationKind::Write => "write",
        }
    }
}

/// Whether the issuing task waited for the operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum IoMode {
    Sync = 0,
    Async = 1,
}

/// One completed I/O operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoEvent {
    /// Capture timestamp (ns)
    pub ts: u64,
    pub pid: u32,
    pub tid: u32,
    pub io_start: u64,
    pub io_end: u64,
    /// Bytes transferred, 0 if not observed
    pub bytes: u64,
    pub comm: Comm,
    pub disk: DiskName,
    pub operation: OperationKind,
    /// `None` when the instrumentation point cannot classify the operation.
    /// On the wire `None` is the byte [`IO_TYPE_UNCLASSIFIED`] (`0xff`), a
    /// code outside the `IoMode` values; readers of raw records must treat
    /// it as unknown.
    pub io_type: Option<IoMode>,
}

impl IoEvent {
    pub fn duration_ns(&self) -> u64 {
        self.io_end.saturating_sub(self.io_start)
    }

    /// Encode into the fixed C-compatible layout
    pub fn to_wire(&self) -> [u8; WIRE_SIZE] {
        let mut buf = [0u8; WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.ts.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.pid.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.tid.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.io_start.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.io_end.to_ne_bytes());
        buf[32..40].copy_from_slice(&self.bytes.to_ne_bytes());
        buf[40..56].copy_from_slice(self.comm.as_bytes());
        buf[56..88].copy_from_slice(self.disk.as_bytes());
        buf[88] = self.operation as u8;
        buf[89] = match self.io_type {
            Some(mode) => mode as u8,
            None => IO_TYPE_UNCLASSIFIED,
        };
        buf
    }

    /// Decode one record; trailing bytes beyond [`WIRE_SIZE`] are ignored
    pub fn from_wire(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < WIRE_SIZE {
            return Err(WireError::Truncated {
                expected: WIRE_SIZE,
                actual: buf.len(),
            });
        }

        let operation =
            OperationKind::from_code(buf[88]).ok_or(WireError::InvalidOperation(buf[88]))?;
        let io_type = match buf[89] {
            0 => Some(IoMode::Sync),
            1 => Some(IoMode::Async),
            IO_TYPE_UNCLASSIFIED => None,
            other => return Err(WireError::InvalidIoMode(other)),
        };

        Ok(Self {
            ts: u64::from_ne_bytes(field(buf, 0)),
            pid: u32::from_ne_bytes(field(buf, 8)),
            tid: u32::from_ne_bytes(field(buf, 12)),
            io_start: u64::from_ne_bytes(field(buf, 16)),
            io_end: u64::from_ne_bytes(field(buf, 24)),
            bytes: u64::from_ne_bytes(field(buf, 32)),
            comm: Comm::from_bytes(field(buf, 40)),
            disk: DiskName::from_bytes(field(buf, 56)),
            operation,
            io_type,
        })
    }
}

/// Decode a buffer of back-to-back records
///
/// A trailing partial record is an error, not silently dropped.
pub fn decode_records(buf: &[u8]) -> Result<Vec<IoEvent>, WireError> {
    let mut chunks = buf.chunks_exact(WIRE_SIZE);
    let events = chunks
        .by_ref()
        .map(IoEvent::from_wire)
        .collect::<Result<Vec<_>, _>>()?;

    let rest = chunks.remainder();
    if !rest.is_empty() {
        return Err(WireError::Truncated {
            expected: WIRE_SIZE,
            actual: rest.len(),
        });
    }
    Ok(events)
}

/// Copy `M` bytes at `offset`; callers have already checked the length
fn field<const M: usize>(buf: &[u8], offset: usize) -> [u8; M] {
    let mut out = [0u8; M];
    out.copy_from_slice(&buf[offset..offset + M]);
    out
}
