//! Per-device I/O statistics.
//!
//! Counters are plain atomics: the device's worker is the only writer, and
//! any thread may take a [`StatsSnapshot`] at any time without locking. Each
//! counter is monotonically increasing for the lifetime of the device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use crate::request::IoOp;

/// Live counters of one device.
#[derive(Debug, Default)]
pub struct DeviceStats {
    completed: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    flushes: AtomicU64,
    discards: AtomicU64,
    errors: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    busy_ns: AtomicU64,
}

impl DeviceStats {
    /// Records one request that reached the backing store.
    ///
    /// `bytes` counts towards the read or write total only when `ok`.
    pub(crate) fn record(&self, op: IoOp, bytes: u64, busy: Duration, ok: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let counter = match op {
            IoOp::Read => &self.reads,
            IoOp::Write => &self.writes,
            IoOp::Flush => &self.flushes,
            IoOp::Discard => &self.discards,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if ok {
            match op {
                IoOp::Read => {
                    self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
                }
                IoOp::Write => {
                    self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
                }
                IoOp::Flush | IoOp::Discard => {}
            }
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        let busy_ns = u64::try_from(busy.as_nanos()).unwrap_or(u64::MAX);
        self.busy_ns.fetch_add(busy_ns, Ordering::Relaxed);
    }

    /// Copies every counter.
    ///
    /// Individual counters never tear; the snapshot as a whole is not atomic
    /// with respect to a request the worker is completing concurrently.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            busy_ns: self.busy_ns.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a device's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Requests executed against the backing store, successful or not.
    pub completed: u64,
    /// Read requests executed.
    pub reads: u64,
    /// Write requests executed.
    pub writes: u64,
    /// Flush requests executed.
    pub flushes: u64,
    /// Discard requests executed.
    pub discards: u64,
    /// Requests that failed on the backing store.
    pub errors: u64,
    /// Bytes returned by successful reads.
    pub bytes_read: u64,
    /// Bytes stored by successful writes.
    pub bytes_written: u64,
    /// Time the worker spent executing requests, in nanoseconds.
    pub busy_ns: u64,
}
