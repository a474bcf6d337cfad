//! Device registry: the set of attached devices and their lifecycle.
//!
//! The registry maps [`DeviceId`]s to shared [`Device`] records. Its lock
//! guards only the identity map and the identities reserved by creations in
//! progress; it is held for insert, remove and lookup and never across
//! allocation, worker start-up or teardown.
//!
//! # Creation
//!
//! 1. Reserve an identity (the requested one, or the lowest free one)
//! 2. Validate the geometry and allocate the backing store
//! 3. Start the worker and mark the device `Active`
//! 4. Publish the device through the [`DeviceNamer`]
//! 5. Insert the record into the map
//!
//! A failure at any step gives back everything acquired so far, including
//! the reserved identity. A device is only visible to [`Registry::lookup`]
//! once all steps have succeeded.
//!
//! # Destruction
//!
//! [`Registry::destroy`] moves the device to `Draining` (refusing with
//! `Busy` unless forced), cancels queued requests, waits for the worker to
//! exit, releases the backing store, unpublishes the name and removes the
//! record. The identity can be reused as soon as `destroy` returns.
//!
//! # Example
//!
//! ```rust
//! use vdisk::{CompletionSink, DeviceParams, IoRequest, IoStatus, ManagerConfig, NullNamer, Registry, SgList};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::load(ManagerConfig::default(), NullNamer)?;
//! let id = registry.create(DeviceParams::memory(1 << 20))?;
//!
//! let (sink, done) = CompletionSink::channel();
//! registry.submit(id, IoRequest::write(0, 1, SgList::from_bytes(&[0xAA; 512]), sink))?;
//! assert_eq!(done.recv()?.status, IoStatus::Ok);
//!
//! registry.lookup(id)?.wait_idle();
//! registry.destroy(id, false)?;
//! registry.unload()?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backing::{BackingKind, BackingStore, FileBacking, MemoryBacking, SwapBacking};
use crate::config::ManagerConfig;
use crate::device::{Device, DeviceId, DeviceParams, DeviceSummary, Teardown};
use crate::error::{Result, VdiskError};
use crate::geometry::{Geometry, validate_sector_size};
use crate::request::{IoRequest, IoStatus};
use crate::worker;

/// Largest file-backed device; file offsets are signed 64-bit on the host.
const FILE_SIZE_LIMIT: u64 = i64::MAX.unsigned_abs();

/// Collaborator that makes devices visible to the host under their names.
///
/// Both calls are made synchronously from `create` and `destroy`.
pub trait DeviceNamer: Send + Sync {
    /// Announces a newly attached device.
    ///
    /// # Errors
    ///
    /// An error aborts the creation; the device is torn down again.
    fn publish(&self, device: &DeviceSummary) -> io::Result<()>;

    /// Withdraws a detached device.
    fn unpublish(&self, id: DeviceId);
}

/// A namer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNamer;

impl DeviceNamer for NullNamer {
    fn publish(&self, _device: &DeviceSummary) -> io::Result<()> {
        Ok(())
    }

    fn unpublish(&self, _id: DeviceId) {}
}

#[derive(Debug, Default)]
struct Slots {
    devices: BTreeMap<DeviceId, Arc<Device>>,
    /// Identities held by creations that have not finished yet.
    reserved: BTreeSet<DeviceId>,
    closed: bool,
}

impl Slots {
    fn in_use(&self, id: DeviceId) -> bool {
        self.devices.contains_key(&id) || self.reserved.contains(&id)
    }
}

/// The set of attached devices.
pub struct Registry {
    config: ManagerConfig,
    namer: Box<dyn DeviceNamer>,
    slots: Mutex<Slots>,
}

impl Registry {
    /// Starts an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`VdiskError::Config`] if `config` is inconsistent.
    pub fn load(config: ManagerConfig, namer: impl DeviceNamer + 'static) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "registry loaded: up to {} device(s), sector sizes {}..={}",
            config.max_devices,
            config.min_sector_size,
            config.max_sector_size
        );
        Ok(Self {
            config,
            namer: Box::new(namer),
            slots: Mutex::new(Slots::default()),
        })
    }

    /// The limits this registry enforces.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Attaches a new device and returns its identity.
    ///
    /// # Errors
    ///
    /// - [`VdiskError::AlreadyExists`] if the requested identity is taken
    /// - [`VdiskError::InvalidParameter`] for a bad identity, sector size,
    ///   size or missing file path
    /// - [`VdiskError::ResourceExhausted`] if no identity is free or the
    ///   backing store cannot be allocated
    /// - [`VdiskError::Io`] if the backing file cannot be opened or extended
    /// - [`VdiskError::Naming`] if the namer refuses the device
    /// - [`VdiskError::Unloaded`] after [`Registry::unload`]
    pub fn create(&self, params: DeviceParams) -> Result<DeviceId> {
        let reservation = self.reserve(params.id)?;
        let id = reservation.id;

        let (geometry, store) = self.allocate(&params)?;
        let device = Arc::new(Device::new(id, geometry, &params));
        device.set_resident(store.resident_bytes());
        let handle = worker::spawn(Arc::clone(&device), store)?;
        device.attach_worker(handle);
        device.activate();

        if let Err(source) = self.namer.publish(&device.summary()) {
            tracing::warn!("{}: publish failed, tearing down: {source}", device.name());
            abandon(&device);
            return Err(VdiskError::Naming { id, source });
        }

        if let Err(device) = reservation.commit(Arc::clone(&device)) {
            self.namer.unpublish(id);
            abandon(&device);
            return Err(VdiskError::Unloaded);
        }

        tracing::info!(
            "attached {}: {} device, {} x {}-byte sectors{}",
            device.name(),
            device.kind(),
            geometry.sector_count,
            geometry.sector_size,
            if device.is_read_only() { ", read-only" } else { "" }
        );
        Ok(id)
    }

    /// Detaches a device and releases its backing store.
    ///
    /// Blocks until the worker has finished any in-flight request and exited.
    /// Must not be called from a completion sink of the same device.
    ///
    /// # Errors
    ///
    /// - [`VdiskError::NotFound`] if the device is unknown or already detaching
    /// - [`VdiskError::Busy`] if `force` is false and requests are outstanding
    /// - [`VdiskError::Release`] or [`VdiskError::WorkerLost`] if teardown
    ///   failed; the device has been removed regardless
    pub fn destroy(&self, id: DeviceId, force: bool) -> Result<()> {
        let device = self.lookup(id)?;
        let cancelled = device.begin_drain(force)?;
        let count = cancelled.len();

        let outcome = teardown(&device, cancelled);
        self.namer.unpublish(id);
        self.slots.lock().devices.remove(&id);
        device.retire(Teardown::from_result(&outcome));

        if count > 0 {
            tracing::info!("detached {} ({count} queued request(s) cancelled)", device.name());
        } else {
            tracing::info!("detached {}", device.name());
        }
        outcome
    }

    /// Returns the record of an attached device.
    ///
    /// # Errors
    ///
    /// Returns [`VdiskError::NotFound`] if no device has this identity.
    pub fn lookup(&self, id: DeviceId) -> Result<Arc<Device>> {
        self.slots
            .lock()
            .devices
            .get(&id)
            .cloned()
            .ok_or(VdiskError::NotFound { id })
    }

    /// Identities of all attached devices, in ascending order.
    pub fn list(&self) -> Vec<DeviceId> {
        self.slots.lock().devices.keys().copied().collect()
    }

    /// Summaries of all attached devices, in ascending identity order.
    pub fn summaries(&self) -> Vec<DeviceSummary> {
        let devices: Vec<Arc<Device>> = self.slots.lock().devices.values().cloned().collect();
        devices.iter().map(|device| device.summary()).collect()
    }

    /// Hands a request to device `id`.
    ///
    /// The request's sink fires exactly once, whether or not this succeeds.
    ///
    /// # Errors
    ///
    /// [`VdiskError::NotFound`] for an unknown device, otherwise as
    /// [`Device::submit`].
    pub fn submit(&self, id: DeviceId, request: IoRequest) -> Result<()> {
        match self.lookup(id) {
            Ok(device) => device.submit(request),
            Err(err) => {
                tracing::debug!("rejected {} for unknown device {id}", request.op());
                request.complete(IoStatus::Rejected, 0);
                Err(err)
            }
        }
    }

    /// Force-detaches every device and refuses further creations.
    ///
    /// Every device is removed even if some fail to tear down. A device
    /// whose detach is already running on another thread is waited for, so
    /// on return no device is attached and every store has been released.
    ///
    /// # Errors
    ///
    /// Returns the first teardown failure, including one met by a concurrent
    /// [`Registry::destroy`].
    pub fn unload(&self) -> Result<()> {
        let (was_closed, devices) = {
            let mut slots = self.slots.lock();
            let was_closed = std::mem::replace(&mut slots.closed, true);
            (was_closed, slots.devices.values().cloned().collect::<Vec<_>>())
        };

        let mut first_error = None;
        for device in devices {
            let id = device.id();
            let outcome = match self.destroy(id, true) {
                // Another caller is detaching it; wait for that to finish.
                Err(VdiskError::NotFound { .. }) => device.wait_retired().into_result(id),
                other => other,
            };
            if let Err(err) = outcome {
                tracing::error!("unload: device {id}: {err}");
                first_error.get_or_insert(err);
            }
        }

        if !was_closed {
            tracing::info!("registry unloaded");
        }
        first_error.map_or(Ok(()), Err)
    }

    fn reserve(&self, requested: Option<DeviceId>) -> Result<Reservation<'_>> {
        let max = self.config.max_devices;
        let mut slots = self.slots.lock();
        if slots.closed {
            return Err(VdiskError::Unloaded);
        }

        let id = match requested {
            Some(id) if id.0 >= max => {
                return Err(VdiskError::invalid(format!(
                    "device id {id} is outside 0..{max}"
                )));
            }
            Some(id) if slots.in_use(id) => return Err(VdiskError::AlreadyExists { id }),
            Some(id) => id,
            None => (0..max)
                .map(DeviceId)
                .find(|id| !slots.in_use(*id))
                .ok_or_else(|| VdiskError::ResourceExhausted {
                    reason: format!("all {max} device ids are in use"),
                })?,
        };

        slots.reserved.insert(id);
        Ok(Reservation {
            registry: self,
            id,
            armed: true,
        })
    }

    /// Validates the geometry and builds the backing store.
    fn allocate(&self, params: &DeviceParams) -> Result<(Geometry, Box<dyn BackingStore>)> {
        let config = &self.config;
        let sector_size = params.sector_size;

        match params.kind {
            BackingKind::Memory => {
                let size = required_size(params)?;
                let geometry =
                    Geometry::from_size(config, size, sector_size, config.max_memory_bytes)?;
                let store = MemoryBacking::new(
                    geometry.capacity_bytes(),
                    config.memory_chunk_size,
                    params.reserve,
                )?;
                Ok((geometry, Box::new(store)))
            }
            BackingKind::Swap => {
                let size = required_size(params)?;
                let geometry =
                    Geometry::from_size(config, size, sector_size, config.max_swap_bytes)?;
                let store = SwapBacking::new(geometry.capacity_bytes())?;
                Ok((geometry, Box::new(store)))
            }
            BackingKind::File => {
                validate_sector_size(config, sector_size)?;
                let path = params
                    .path
                    .as_deref()
                    .ok_or_else(|| VdiskError::invalid("a file device needs a backing path"))?;
                // Check an explicit size before the file is touched (and possibly extended).
                if let Some(size) = params.size_bytes {
                    Geometry::from_size(config, size, sector_size, FILE_SIZE_LIMIT)?;
                }

                let store = FileBacking::open(path, params.size_bytes, params.read_only)?;
                // A file whose length is not a whole number of sectors loses its tail.
                let usable = store.capacity_bytes() / u64::from(sector_size) * u64::from(sector_size);
                let geometry = Geometry::from_size(config, usable, sector_size, FILE_SIZE_LIMIT)?;
                Ok((geometry, Box::new(store)))
            }
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        if let Err(err) = self.unload() {
            tracing::error!("registry dropped with teardown failures: {err}");
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("devices", &slots.devices.keys().collect::<Vec<_>>())
            .field("reserved", &slots.reserved)
            .field("closed", &slots.closed)
            .finish_non_exhaustive()
    }
}

/// An identity held for a creation in progress.
///
/// Dropping it without [`Reservation::commit`] frees the identity again.
struct Reservation<'a> {
    registry: &'a Registry,
    id: DeviceId,
    armed: bool,
}

impl Reservation<'_> {
    /// Publishes `device` under the reserved identity.
    ///
    /// Gives the device back if the registry was unloaded meanwhile.
    fn commit(mut self, device: Arc<Device>) -> std::result::Result<(), Arc<Device>> {
        let mut slots = self.registry.slots.lock();
        slots.reserved.remove(&self.id);
        self.armed = false;
        if slots.closed {
            return Err(device);
        }
        slots.devices.insert(self.id, device);
        Ok(())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.slots.lock().reserved.remove(&self.id);
        }
    }
}

fn required_size(params: &DeviceParams) -> Result<u64> {
    params.size_bytes.ok_or_else(|| {
        VdiskError::invalid(format!("a {} device needs an explicit size", params.kind))
    })
}

/// Stops the worker and releases the store of a drained device.
///
/// `cancelled` are the requests taken off the queue; each reports
/// [`IoStatus::Cancelled`].
fn teardown(device: &Device, cancelled: Vec<IoRequest>) -> Result<()> {
    for request in cancelled {
        request.complete(IoStatus::Cancelled, 0);
    }

    let id = device.id();
    let outcome = match device.take_worker() {
        Some(handle) => match handle.join() {
            Ok(store) => store.release().map_err(|source| {
                tracing::error!("{}: failed to release backing store: {source}", device.name());
                VdiskError::Release { id, source }
            }),
            Err(_) => {
                tracing::error!("{}: worker terminated abnormally", device.name());
                Err(VdiskError::WorkerLost { id })
            }
        },
        None => Ok(()),
    };

    device.mark_destroyed();
    outcome
}

/// Tears down a device that never made it into the map.
fn abandon(device: &Device) {
    let result = device
        .begin_drain(true)
        .and_then(|cancelled| teardown(device, cancelled));
    if let Err(err) = result {
        tracing::error!("{}: abandoning half-created device: {err}", device.name());
    }
}
