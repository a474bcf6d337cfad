//! I/O requests and their completions.
//!
//! An [`IoRequest`] is built by the submitter, owned by the device queue
//! until the worker takes it, and consumed by the worker, which fires its
//! [`CompletionSink`] exactly once. The buffer travels with the request and
//! comes back inside the [`Completion`], so read data is returned by moving
//! ownership rather than by sharing.
//!
//! A sink that is dropped without having fired reports
//! [`IoStatus::Cancelled`], so no request can vanish silently.

use std::fmt;
use std::io;
use std::sync::mpsc;

use serde::Serialize;

use crate::mapper::SgList;

/// What a request asks the device to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IoOp {
    /// Copy sectors from the device into the buffer.
    Read,
    /// Copy the buffer onto sectors of the device.
    Write,
    /// Make previous writes durable.
    Flush,
    /// Drop the contents of sectors; they read back as zeros.
    Discard,
}

impl IoOp {
    /// Returns true for operations that modify the device.
    pub fn mutates(self) -> bool {
        matches!(self, Self::Write | Self::Discard)
    }

    /// Returns true for operations that transfer data through a buffer.
    pub fn transfers(self) -> bool {
        matches!(self, Self::Read | Self::Write)
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Flush => "flush",
            Self::Discard => "discard",
        })
    }
}

/// Outcome reported to a completion sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The request finished successfully.
    Ok,
    /// The backing medium failed; the device stays attached.
    IoError(io::ErrorKind),
    /// The request was dropped by a forced detach before it started.
    Cancelled,
    /// The request addressed sectors beyond the device; it never reached the medium.
    OutOfRange,
    /// The request was refused before queueing (read-only device, device not
    /// attached, or malformed buffer).
    Rejected,
}

impl IoStatus {
    /// Returns true for [`IoStatus::Ok`].
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::IoError(kind) => write!(f, "I/O error ({kind})"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::OutOfRange => f.write_str("out of range"),
            Self::Rejected => f.write_str("rejected"),
        }
    }
}

/// What the completion sink receives.
#[derive(Debug)]
pub struct Completion {
    /// Final status of the request.
    pub status: IoStatus,
    /// Bytes transferred (zero on failure, and for flushes).
    pub bytes: u64,
    /// The request's buffer, holding read data for successful reads.
    pub buffer: SgList,
}

type Callback = Box<dyn FnOnce(Completion) + Send + 'static>;

/// One-shot destination for a request's [`Completion`].
pub struct CompletionSink {
    callback: Option<Callback>,
}

impl CompletionSink {
    /// Wraps a callback. It runs on whichever thread completes the request.
    pub fn new(f: impl FnOnce(Completion) + Send + 'static) -> Self {
        Self {
            callback: Some(Box::new(f)),
        }
    }

    /// A sink that forwards its completion into a channel.
    pub fn channel() -> (Self, mpsc::Receiver<Completion>) {
        let (tx, rx) = mpsc::channel();
        let sink = Self::new(move |completion| {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(completion);
        });
        (sink, rx)
    }

    /// A sink that ignores its completion.
    pub fn ignore() -> Self {
        Self::new(|_| {})
    }

    pub(crate) fn fire(mut self, completion: Completion) {
        if let Some(callback) = self.callback.take() {
            callback(completion);
        }
    }
}

impl Drop for CompletionSink {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Completion {
                status: IoStatus::Cancelled,
                bytes: 0,
                buffer: SgList::new(),
            });
        }
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSink")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// A single block I/O request.
#[derive(Debug)]
pub struct IoRequest {
    pub(crate) op: IoOp,
    pub(crate) start_sector: u64,
    pub(crate) sector_count: u64,
    pub(crate) buffer: SgList,
    pub(crate) sink: CompletionSink,
}

impl IoRequest {
    /// Reads `sector_count` sectors starting at `start_sector` into `buffer`.
    ///
    /// `buffer` must be exactly `sector_count * sector_size` bytes long.
    pub fn read(start_sector: u64, sector_count: u64, buffer: SgList, sink: CompletionSink) -> Self {
        Self {
            op: IoOp::Read,
            start_sector,
            sector_count,
            buffer,
            sink,
        }
    }

    /// Writes `buffer` to `sector_count` sectors starting at `start_sector`.
    ///
    /// `buffer` must be exactly `sector_count * sector_size` bytes long.
    pub fn write(start_sector: u64, sector_count: u64, buffer: SgList, sink: CompletionSink) -> Self {
        Self {
            op: IoOp::Write,
            start_sector,
            sector_count,
            buffer,
            sink,
        }
    }

    /// Flushes previously completed writes to the medium.
    pub fn flush(sink: CompletionSink) -> Self {
        Self {
            op: IoOp::Flush,
            start_sector: 0,
            sector_count: 0,
            buffer: SgList::new(),
            sink,
        }
    }

    /// Discards `sector_count` sectors starting at `start_sector`.
    pub fn discard(start_sector: u64, sector_count: u64, sink: CompletionSink) -> Self {
        Self {
            op: IoOp::Discard,
            start_sector,
            sector_count,
            buffer: SgList::new(),
            sink,
        }
    }

    /// The requested operation.
    pub fn op(&self) -> IoOp {
        self.op
    }

    /// First sector addressed.
    pub fn start_sector(&self) -> u64 {
        self.start_sector
    }

    /// Number of sectors addressed.
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Length of the attached buffer in bytes.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Consumes the request and fires its sink.
    pub(crate) fn complete(self, status: IoStatus, bytes: u64) {
        let Self { buffer, sink, .. } = self;
        sink.fire(Completion {
            status,
            bytes,
            buffer,
        });
    }
}
