//! Operator-facing control surface.
//!
//! [`ControlSurface`] wraps a [`Registry`] with the commands an operator
//! issues: attach, detach, list, statistics and resize. Parameters are
//! checked for structural consistency here, before the registry sees them;
//! limits that depend on configuration are checked by the registry.

use crate::backing::BackingKind;
use crate::device::{DeviceId, DeviceParams, DeviceSummary};
use crate::error::{Result, VdiskError};
use crate::registry::Registry;
use crate::stats::StatsSnapshot;

/// Longest accepted device label, in bytes.
pub const MAX_LABEL_LEN: usize = 64;

/// Attach/detach/list/stats commands over a registry.
#[derive(Debug)]
pub struct ControlSurface {
    registry: Registry,
}

impl ControlSurface {
    /// Wraps `registry`.
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    /// The underlying registry, for submitting I/O.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Attaches a device.
    ///
    /// # Errors
    ///
    /// Returns [`VdiskError::InvalidParameter`] if the parameters are
    /// inconsistent for the backing kind, otherwise as [`Registry::create`].
    pub fn attach(&self, params: DeviceParams) -> Result<DeviceId> {
        validate_params(&params)?;
        self.registry.create(params)
    }

    /// Detaches a device; see [`Registry::destroy`].
    ///
    /// # Errors
    ///
    /// As [`Registry::destroy`].
    pub fn detach(&self, id: DeviceId, force: bool) -> Result<()> {
        self.registry.destroy(id, force)
    }

    /// Describes every attached device.
    pub fn list(&self) -> Vec<DeviceSummary> {
        self.registry.summaries()
    }

    /// Reads a device's counters.
    ///
    /// # Errors
    ///
    /// Returns [`VdiskError::NotFound`] for an unknown device.
    pub fn stats(&self, id: DeviceId) -> Result<StatsSnapshot> {
        Ok(self.registry.lookup(id)?.stats())
    }

    /// Changing the size of an attached device is not supported; detach and
    /// attach again instead.
    ///
    /// # Errors
    ///
    /// Always returns [`VdiskError::Unsupported`].
    pub fn resize(&self, id: DeviceId, size_bytes: u64) -> Result<()> {
        tracing::debug!("refused resize of device {id} to {size_bytes} bytes");
        Err(VdiskError::Unsupported { operation: "resize" })
    }

    /// Detaches everything; see [`Registry::unload`].
    ///
    /// # Errors
    ///
    /// As [`Registry::unload`].
    pub fn unload(&self) -> Result<()> {
        self.registry.unload()
    }
}

/// Checks that `params` make sense for their backing kind.
///
/// # Errors
///
/// Returns [`VdiskError::InvalidParameter`] describing the first problem.
pub fn validate_params(params: &DeviceParams) -> Result<()> {
    match params.kind {
        BackingKind::File => {
            if params.path.is_none() {
                return Err(VdiskError::invalid("a file device needs a backing path"));
            }
        }
        BackingKind::Memory | BackingKind::Swap => {
            if params.size_bytes.is_none() {
                return Err(VdiskError::invalid(format!(
                    "a {} device needs an explicit size",
                    params.kind
                )));
            }
            if params.path.is_some() {
                return Err(VdiskError::invalid(format!(
                    "a {} device does not take a backing path",
                    params.kind
                )));
            }
        }
    }

    if params.reserve && params.kind != BackingKind::Memory {
        return Err(VdiskError::invalid(format!(
            "reserve applies to memory devices only, not {}",
            params.kind
        )));
    }

    if let Some(label) = &params.label {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(VdiskError::invalid(format!(
                "label must be 1..={MAX_LABEL_LEN} bytes, got {}",
                label.len()
            )));
        }
        if label.chars().any(char::is_control) {
            return Err(VdiskError::invalid("label contains control characters"));
        }
    }

    Ok(())
}
