//! Error types for the vdisk block-device manager.

use std::path::PathBuf;

use thiserror::Error;

use crate::device::DeviceId;

/// The main error type for all vdisk operations.
///
/// Validation failures are returned synchronously to the caller of the
/// Control Surface or Registry. Failures of the backing medium during I/O are
/// not represented here: they travel to the request's completion sink as an
/// [`IoStatus`](crate::request::IoStatus) and never stop the device worker.
#[derive(Error, Debug)]
pub enum VdiskError {
    /// A creation or request parameter is malformed or outside its limits.
    #[error("invalid parameter: {reason}")]
    InvalidParameter {
        /// Description of what was invalid.
        reason: String,
    },

    /// The requested identity is already attached (or being attached).
    #[error("device {id} already exists")]
    AlreadyExists {
        /// The conflicting identity.
        id: DeviceId,
    },

    /// No attached device has this identity.
    #[error("device {id} not found")]
    NotFound {
        /// The unknown identity.
        id: DeviceId,
    },

    /// An unforced detach found requests still queued or in flight.
    #[error("device {id} is busy: {outstanding} request(s) outstanding")]
    Busy {
        /// The device that refused the detach.
        id: DeviceId,
        /// Number of queued plus in-flight requests at the time of the check.
        outstanding: usize,
    },

    /// A request addressed sectors beyond the end of the device.
    #[error("sectors {start}..{end} are outside device capacity of {capacity} sectors")]
    OutOfRange {
        /// First requested sector.
        start: u64,
        /// One past the last requested sector (saturating).
        end: u64,
        /// Device capacity in sectors.
        capacity: u64,
    },

    /// A write or discard was submitted to a read-only device.
    #[error("device {id} is read-only")]
    ReadOnly {
        /// The read-only device.
        id: DeviceId,
    },

    /// The operation is not supported by this manager.
    #[error("operation '{operation}' is not supported")]
    Unsupported {
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// A backing store or identity could not be allocated.
    #[error("resources exhausted: {reason}")]
    ResourceExhausted {
        /// Description of the exhausted resource.
        reason: String,
    },

    /// Opening or sizing a backing file failed.
    #[error("backing file '{}': {source}", path.display())]
    Io {
        /// The backing file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backing store of a detached device could not be released cleanly.
    #[error("failed to release backing store of device {id}: {source}")]
    Release {
        /// The detached device.
        id: DeviceId,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The naming collaborator refused to publish the device.
    #[error("failed to publish device {id}: {source}")]
    Naming {
        /// The device being attached.
        id: DeviceId,
        /// The collaborator's error.
        #[source]
        source: std::io::Error,
    },

    /// A device worker terminated abnormally.
    #[error("worker of device {id} terminated abnormally")]
    WorkerLost {
        /// The device whose worker was lost.
        id: DeviceId,
    },

    /// The registry has been unloaded and accepts no new devices.
    #[error("registry is unloaded")]
    Unloaded,

    /// Manager configuration error.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl VdiskError {
    /// Shorthand for [`VdiskError::InvalidParameter`].
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while loading or validating a [`ManagerConfig`](crate::config::ManagerConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for this schema.
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A configured value is out of its permitted range.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The offending field.
        field: &'static str,
        /// Why the value is invalid.
        reason: String,
    },
}

/// Type alias for `Result<T, VdiskError>`.
pub type Result<T> = std::result::Result<T, VdiskError>;
