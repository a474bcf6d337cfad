//! Device records.
//!
//! A [`Device`] is the shared record of one attached virtual disk. The
//! registry owns it; the device's worker holds a second handle for as long as
//! it runs. Fixed attributes (identity, geometry, backing kind) are plain
//! fields. The mutable part (request queue, in-flight marker, lifecycle
//! state) sits behind one record-local lock, paired with two condition
//! variables:
//!
//! - `wake`: signalled on enqueue and on drain; the worker sleeps on it
//! - `idle`: signalled when the queue empties and nothing is in flight, and
//!   when a detach has finished
//!
//! Statistics are atomics outside the lock.
//!
//! # Lifecycle
//!
//! ```text
//! Creating ──activate──▶ Active ──begin_drain──▶ Draining ──▶ Destroyed
//! ```
//!
//! Only an `Active` device accepts requests. `begin_drain` flips the state
//! and empties the queue under the same lock acquisition, so a request can
//! never be queued on a device that is going away.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::backing::{BackingKind, BackingStore};
use crate::error::{Result, VdiskError};
use crate::geometry::Geometry;
use crate::request::{IoOp, IoRequest, IoStatus};
use crate::stats::{DeviceStats, StatsSnapshot};

/// Identity of an attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// Published device name, e.g. `vd3`.
    pub fn name(self) -> String {
        format!("vd{}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Parameters validated, backing store allocated, not yet published.
    Creating,
    /// Accepting and servicing I/O.
    Active,
    /// Detach in progress; no new requests are accepted.
    Draining,
    /// Worker stopped and backing store released.
    Destroyed,
}

impl DeviceState {
    /// Returns true once a detach has started.
    pub fn is_stopping(self) -> bool {
        matches!(self, Self::Draining | Self::Destroyed)
    }
}

/// Parameters of a device to attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Backing medium.
    pub kind: BackingKind,
    /// Size in bytes. Required for memory and swap; optional for files,
    /// which otherwise take the file's length.
    pub size_bytes: Option<u64>,
    /// Bytes per sector.
    pub sector_size: u32,
    /// Requested identity; the lowest free one is chosen when `None`.
    pub id: Option<DeviceId>,
    /// Backing file, for file devices only.
    pub path: Option<PathBuf>,
    /// Refuse writes and discards.
    pub read_only: bool,
    /// Allocate all memory up front (memory devices only).
    pub reserve: bool,
    /// Free-form operator label.
    pub label: Option<String>,
}

impl DeviceParams {
    /// Default sector size for new devices.
    pub const DEFAULT_SECTOR_SIZE: u32 = 512;

    fn new(kind: BackingKind) -> Self {
        Self {
            kind,
            size_bytes: None,
            sector_size: Self::DEFAULT_SECTOR_SIZE,
            id: None,
            path: None,
            read_only: false,
            reserve: false,
            label: None,
        }
    }

    /// A memory-backed device of `size_bytes`.
    pub fn memory(size_bytes: u64) -> Self {
        Self::new(BackingKind::Memory).with_size(size_bytes)
    }

    /// A swap-backed device of `size_bytes`.
    pub fn swap(size_bytes: u64) -> Self {
        Self::new(BackingKind::Swap).with_size(size_bytes)
    }

    /// A device backed by the file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::new(BackingKind::File)
        }
    }

    /// Sets the size in bytes.
    #[must_use]
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    /// Sets the sector size.
    #[must_use]
    pub fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Requests a specific identity.
    #[must_use]
    pub fn with_id(mut self, id: DeviceId) -> Self {
        self.id = Some(id);
        self
    }

    /// Marks the device read-only.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Allocates all backing memory at creation.
    #[must_use]
    pub fn reserve(mut self, reserve: bool) -> Self {
        self.reserve = reserve;
        self
    }

    /// Attaches an operator label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Externally visible description of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSummary {
    /// Identity.
    pub id: DeviceId,
    /// Published name (`vd<N>`).
    pub name: String,
    /// Backing medium.
    pub kind: BackingKind,
    /// Lifecycle state at the time of the call.
    pub state: DeviceState,
    /// Bytes per sector.
    pub sector_size: u32,
    /// Total sectors.
    pub sector_count: u64,
    /// Capacity in bytes.
    pub capacity_bytes: u64,
    /// Bytes currently held by the backing medium.
    pub resident_bytes: u64,
    /// Whether writes are refused.
    pub read_only: bool,
    /// Operator label, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Backing file, for file devices.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// How a finished detach ended.
///
/// Kept on the record so that a caller who found the detach already under
/// way can wait for it and learn its outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Worker joined and store released.
    Clean,
    /// The backing store failed to release.
    ReleaseFailed(io::ErrorKind, String),
    /// The worker had terminated abnormally.
    WorkerLost,
}

impl Teardown {
    /// Summarises the result of a teardown.
    pub(crate) fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self::Clean,
            Err(VdiskError::Release { source, .. }) => {
                Self::ReleaseFailed(source.kind(), source.to_string())
            }
            Err(_) => Self::WorkerLost,
        }
    }

    /// Turns the outcome back into an error for device `id`.
    pub(crate) fn into_result(self, id: DeviceId) -> Result<()> {
        match self {
            Self::Clean => Ok(()),
            Self::ReleaseFailed(kind, message) => Err(VdiskError::Release {
                id,
                source: io::Error::new(kind, message),
            }),
            Self::WorkerLost => Err(VdiskError::WorkerLost { id }),
        }
    }
}

/// Mutable part of a device record.
#[derive(Debug)]
struct Queue {
    pending: VecDeque<IoRequest>,
    in_flight: bool,
    state: DeviceState,
    /// The worker died; nothing will service the queue again.
    lost: bool,
    /// Set once a detach has removed the device from the registry.
    retired: Option<Teardown>,
}

impl Queue {
    fn outstanding(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight)
    }
}

/// One attached virtual disk.
pub struct Device {
    id: DeviceId,
    geometry: Geometry,
    kind: BackingKind,
    read_only: bool,
    label: Option<String>,
    path: Option<PathBuf>,
    queue: Mutex<Queue>,
    wake: Condvar,
    idle: Condvar,
    stats: DeviceStats,
    resident: AtomicU64,
    worker: Mutex<Option<JoinHandle<Box<dyn BackingStore>>>>,
}

impl Device {
    pub(crate) fn new(id: DeviceId, geometry: Geometry, params: &DeviceParams) -> Self {
        Self {
            id,
            geometry,
            kind: params.kind,
            read_only: params.read_only,
            label: params.label.clone(),
            path: params.path.clone(),
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                in_flight: false,
                state: DeviceState::Creating,
                lost: false,
                retired: None,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
            stats: DeviceStats::default(),
            resident: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Identity of this device.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Published name (`vd<N>`).
    pub fn name(&self) -> String {
        self.id.name()
    }

    /// Addressing layout.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Backing medium.
    pub fn kind(&self) -> BackingKind {
        self.kind
    }

    /// Whether writes and discards are refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Operator label.
    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Backing file path, for file devices.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.queue.lock().state
    }

    /// Requests queued plus the one in flight, if any.
    pub fn outstanding(&self) -> usize {
        self.queue.lock().outstanding()
    }

    /// Snapshot of this device's counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Describes this device.
    pub fn summary(&self) -> DeviceSummary {
        let state = self.state();
        DeviceSummary {
            id: self.id,
            name: self.name(),
            kind: self.kind,
            state,
            sector_size: self.geometry.sector_size,
            sector_count: self.geometry.sector_count,
            capacity_bytes: self.geometry.capacity_bytes(),
            resident_bytes: self.resident.load(Ordering::Relaxed),
            read_only: self.read_only,
            label: self.label.clone(),
            path: self.path.clone(),
        }
    }

    /// Queues `request` for the worker.
    ///
    /// Invalid requests never reach the queue: their sink fires immediately
    /// (on the calling thread) and the reason is also returned.
    ///
    /// # Errors
    ///
    /// - [`VdiskError::OutOfRange`] if the request addresses sectors beyond
    ///   the device; the sink sees [`IoStatus::OutOfRange`]
    /// - [`VdiskError::ReadOnly`] for a write or discard on a read-only device
    /// - [`VdiskError::InvalidParameter`] for a zero-length transfer or a
    ///   buffer whose length does not match the sector count
    /// - [`VdiskError::NotFound`] if the device is not `Active`
    /// - [`VdiskError::WorkerLost`] if the device's worker has died
    ///
    /// All but the first report [`IoStatus::Rejected`] to the sink.
    pub fn submit(&self, request: IoRequest) -> Result<()> {
        if let Err(err) = self.validate(&request) {
            let status = match err {
                VdiskError::OutOfRange { .. } => IoStatus::OutOfRange,
                _ => IoStatus::Rejected,
            };
            return self.reject(request, status, err);
        }

        let mut queue = self.queue.lock();
        if queue.lost {
            drop(queue);
            return self.reject(request, IoStatus::Rejected, VdiskError::WorkerLost { id: self.id });
        }
        if queue.state != DeviceState::Active {
            drop(queue);
            return self.reject(request, IoStatus::Rejected, VdiskError::NotFound { id: self.id });
        }
        queue.pending.push_back(request);
        drop(queue);
        self.wake.notify_one();
        Ok(())
    }

    /// Checks everything about a request that does not depend on state.
    fn validate(&self, request: &IoRequest) -> Result<()> {
        let op = request.op;
        if op == IoOp::Flush {
            return Ok(());
        }

        // Addressing is checked first: a request outside the device is
        // OutOfRange whatever else is wrong with it.
        let start = request.start_sector;
        if start >= self.geometry.sector_count {
            return Err(VdiskError::OutOfRange {
                start,
                end: start.saturating_add(request.sector_count),
                capacity: self.geometry.sector_count,
            });
        }
        self.geometry.check_range(start, request.sector_count)?;

        if request.sector_count == 0 {
            return Err(VdiskError::invalid(format!("{op} of zero sectors")));
        }
        if self.read_only && op.mutates() {
            return Err(VdiskError::ReadOnly { id: self.id });
        }

        if op.transfers() {
            let expected = self.geometry.byte_offset(request.sector_count);
            let actual = request.buffer.len() as u64;
            if actual != expected {
                return Err(VdiskError::invalid(format!(
                    "{op} of {} sector(s) needs a {expected}-byte buffer, got {actual}",
                    request.sector_count
                )));
            }
        }
        Ok(())
    }

    fn reject(&self, request: IoRequest, status: IoStatus, err: VdiskError) -> Result<()> {
        tracing::debug!("{}: rejected {}: {err}", self.name(), request.op);
        request.complete(status, 0);
        Err(err)
    }

    /// Blocks until the queue is empty and no request is in flight.
    pub fn wait_idle(&self) {
        let mut queue = self.queue.lock();
        while queue.outstanding() > 0 {
            self.idle.wait(&mut queue);
        }
    }

    // --- transitions driven by the registry ---

    pub(crate) fn activate(&self) {
        self.queue.lock().state = DeviceState::Active;
    }

    /// Moves an `Active` device to `Draining`.
    ///
    /// Without `force`, refuses while anything is queued or in flight. With
    /// `force`, takes every queued request out and returns them for
    /// cancellation; a request already in flight is left to finish.
    pub(crate) fn begin_drain(&self, force: bool) -> Result<Vec<IoRequest>> {
        let mut queue = self.queue.lock();
        if queue.state != DeviceState::Active {
            return Err(VdiskError::NotFound { id: self.id });
        }
        let outstanding = queue.outstanding();
        if !force && outstanding > 0 {
            return Err(VdiskError::Busy {
                id: self.id,
                outstanding,
            });
        }
        queue.state = DeviceState::Draining;
        let cancelled: Vec<IoRequest> = queue.pending.drain(..).collect();
        drop(queue);
        self.wake.notify_all();
        self.idle.notify_all();
        Ok(cancelled)
    }

    pub(crate) fn mark_destroyed(&self) {
        self.queue.lock().state = DeviceState::Destroyed;
    }

    /// Records the outcome of a detach once the record has left the registry.
    pub(crate) fn retire(&self, outcome: Teardown) {
        self.queue.lock().retired = Some(outcome);
        self.idle.notify_all();
    }

    /// Blocks until [`Device::retire`] has been called and returns its outcome.
    pub(crate) fn wait_retired(&self) -> Teardown {
        let mut queue = self.queue.lock();
        loop {
            if let Some(outcome) = &queue.retired {
                return outcome.clone();
            }
            self.idle.wait(&mut queue);
        }
    }

    pub(crate) fn attach_worker(&self, handle: JoinHandle<Box<dyn BackingStore>>) {
        *self.worker.lock() = Some(handle);
    }

    pub(crate) fn take_worker(&self) -> Option<JoinHandle<Box<dyn BackingStore>>> {
        self.worker.lock().take()
    }

    // --- worker side ---

    /// Waits for the next request and marks it in flight.
    ///
    /// Returns `None` once the device is stopping and the queue is empty.
    pub(crate) fn next_request(&self) -> Option<IoRequest> {
        let mut queue = self.queue.lock();
        loop {
            if let Some(request) = queue.pending.pop_front() {
                queue.in_flight = true;
                return Some(request);
            }
            if queue.state.is_stopping() {
                return None;
            }
            self.wake.wait(&mut queue);
        }
    }

    /// Clears the in-flight marker after the request's sink has fired.
    pub(crate) fn finish_request(&self) {
        let mut queue = self.queue.lock();
        queue.in_flight = false;
        if queue.pending.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Records that the worker died: queued requests are dropped (their sinks
    /// report `Cancelled`) and later submissions are refused.
    pub(crate) fn worker_lost(&self) {
        let mut queue = self.queue.lock();
        queue.lost = true;
        queue.in_flight = false;
        let orphaned: Vec<IoRequest> = queue.pending.drain(..).collect();
        drop(queue);
        self.idle.notify_all();
        drop(orphaned);
    }

    pub(crate) fn record(&self, op: IoOp, bytes: u64, busy: std::time::Duration, ok: bool) {
        self.stats.record(op, bytes, busy, ok);
    }

    pub(crate) fn set_resident(&self, bytes: u64) {
        self.resident.store(bytes, Ordering::Relaxed);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("geometry", &self.geometry)
            .field("read_only", &self.read_only)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
