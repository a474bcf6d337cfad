//! Per-device I/O worker.
//!
//! Each attached device gets one named thread (`vd<N>-io`) that owns the
//! device's backing store. The loop takes one request at a time off the
//! device queue, runs it against the store through the page mapper, records
//! statistics, fires the completion sink and only then looks at the next
//! request, so completions leave a device in submission order.
//!
//! A failing backing store is reported to the request and the loop carries
//! on. When the device starts draining and the queue is empty the thread
//! returns the store through its join handle so the registry can release it.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::backing::BackingStore;
use crate::device::Device;
use crate::error::{Result, VdiskError};
use crate::geometry::Geometry;
use crate::mapper::{MapDirection, with_mapped_window};
use crate::request::{IoOp, IoRequest, IoStatus};

/// Starts the worker of `device`.
///
/// # Errors
///
/// Returns [`VdiskError::ResourceExhausted`] if the thread cannot be spawned.
/// The store is dropped in that case.
pub(crate) fn spawn(
    device: Arc<Device>,
    store: Box<dyn BackingStore>,
) -> Result<JoinHandle<Box<dyn BackingStore>>> {
    let name = format!("{}-io", device.name());
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || run(&device, store))
        .map_err(|e| VdiskError::ResourceExhausted {
            reason: format!("spawning worker thread {name}: {e}"),
        })
}

fn run(device: &Device, mut store: Box<dyn BackingStore>) -> Box<dyn BackingStore> {
    let _guard = LostGuard(device);
    let geometry = device.geometry();
    tracing::debug!("{}: worker started ({} store)", device.name(), store.kind());

    while let Some(mut request) = device.next_request() {
        let op = request.op;
        let started = Instant::now();
        let result = execute(&geometry, store.as_mut(), &mut request);
        let busy = started.elapsed();

        let (status, bytes) = match result {
            Ok(bytes) => (IoStatus::Ok, bytes),
            Err(e) => {
                tracing::warn!(
                    "{}: {op} at sector {} failed: {e}",
                    device.name(),
                    request.start_sector
                );
                (IoStatus::IoError(e.kind()), 0)
            }
        };
        device.record(op, bytes, busy, status.is_ok());
        device.set_resident(store.resident_bytes());

        request.complete(status, bytes);
        device.finish_request();
    }

    tracing::debug!("{}: worker stopped", device.name());
    store
}

/// Runs one request and returns the bytes it transferred.
fn execute(
    geometry: &Geometry,
    store: &mut dyn BackingStore,
    request: &mut IoRequest,
) -> io::Result<u64> {
    let offset = geometry.byte_offset(request.start_sector);
    let len = geometry.byte_offset(request.sector_count);

    match request.op {
        IoOp::Read => {
            with_mapped_window(&mut request.buffer, MapDirection::FromDevice, |window| {
                store.read_into(window, offset)
            })?;
            Ok(len)
        }
        IoOp::Write => {
            with_mapped_window(&mut request.buffer, MapDirection::ToDevice, |window| {
                store.write_from(window, offset)
            })?;
            Ok(len)
        }
        IoOp::Flush => store.flush().map(|()| 0),
        IoOp::Discard => store.discard(offset, len).map(|()| 0),
    }
}

/// Marks the device as lost if the worker unwinds.
struct LostGuard<'a>(&'a Device);

impl Drop for LostGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("{}: worker panicked", self.0.name());
            self.0.worker_lost();
        }
    }
}
