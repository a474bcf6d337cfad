//! # vdisk
//!
//! Virtual block-device manager.
//!
//! vdisk attaches and detaches "virtual disks": devices that look
//! like ordinary block devices to a host, backed by anonymous memory, a host
//! file, or pageable (swap-backed) memory. Any number of devices can be
//! attached at once; each has its own request queue and I/O worker thread.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - One worker per device; completions leave a device in submission order
//! - Every request's completion sink fires exactly once, even on cancellation
//! - Invalid requests are refused before they are queued
//! - Backing-store failures are reported per request and never stop a device
//! - Teardown always releases the backing store, including on failed creation
//!
//! ## Quick Start
//!
//! ```rust
//! use vdisk::{CompletionSink, ControlSurface, DeviceParams, IoRequest, IoStatus};
//! use vdisk::{ManagerConfig, NullNamer, Registry, SgList};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let control = ControlSurface::new(Registry::load(ManagerConfig::default(), NullNamer)?);
//!
//! // 1024 sectors of 512 bytes, backed by memory
//! let id = control.attach(DeviceParams::memory(512 * 1024))?;
//!
//! let (sink, done) = CompletionSink::channel();
//! let data = SgList::from_bytes(&[0xAA; 10 * 512]);
//! control.registry().submit(id, IoRequest::write(0, 10, data, sink))?;
//! assert_eq!(done.recv()?.status, IoStatus::Ok);
//!
//! let (sink, done) = CompletionSink::channel();
//! control.registry().submit(id, IoRequest::read(0, 10, SgList::zeroed(10 * 512), sink))?;
//! let completion = done.recv()?;
//! assert!(completion.buffer.to_vec().iter().all(|&b| b == 0xAA));
//!
//! control.detach(id, true)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`ControlSurface`]: operator commands
//! - [`Registry`]: identity map and device lifecycle
//! - [`Device`]: per-device record holding the queue and counters
//! - [`BackingStore`]: memory, file and swap media
//! - [`IoRequest`] / [`CompletionSink`]: the host I/O boundary
//!
//! ## Modules
//!
//! - [`control`]: Operator commands and parameter validation
//! - [`registry`]: Device registry and the naming collaborator
//! - [`device`]: Device records, identities and parameters
//! - [`request`]: Requests, completions and statuses
//! - [`mapper`]: Scatter/gather buffers and window mapping
//! - [`backing`]: Backing stores
//! - [`geometry`]: Sector geometry and range checks
//! - [`stats`]: Per-device counters
//! - [`config`]: Manager limits
//! - [`error`]: Error types

pub mod backing;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod geometry;
pub mod mapper;
pub mod registry;
pub mod request;
pub mod stats;
mod worker;

// Re-export primary API types at crate root for convenience.
pub use backing::{BackingKind, BackingStore};
pub use config::ManagerConfig;
pub use control::ControlSurface;
pub use device::{Device, DeviceId, DeviceParams, DeviceState, DeviceSummary};
pub use error::{ConfigError, Result, VdiskError};
pub use geometry::Geometry;
pub use mapper::{MapDirection, SgList};
pub use registry::{DeviceNamer, NullNamer, Registry};
pub use request::{Completion, CompletionSink, IoOp, IoRequest, IoStatus};
pub use stats::StatsSnapshot;
