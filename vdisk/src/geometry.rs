//! Device geometry: sector size and sector count.

use serde::{Deserialize, Serialize};

use crate::config::ManagerConfig;
use crate::error::{Result, VdiskError};

/// Fixed addressing layout of a device.
///
/// Geometry is decided once at creation and never changes while the device
/// is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Bytes per sector (power of two).
    pub sector_size: u32,
    /// Total addressable sectors.
    pub sector_count: u64,
}

impl Geometry {
    /// Derives a geometry from a byte size, validating it against `config`.
    ///
    /// `limit` is the largest size the chosen backing kind accepts.
    ///
    /// # Errors
    ///
    /// Returns [`VdiskError::InvalidParameter`] if the sector size is not an
    /// accepted power of two, if `size_bytes` is zero, not a multiple of the
    /// sector size, or larger than `limit`.
    pub fn from_size(
        config: &ManagerConfig,
        size_bytes: u64,
        sector_size: u32,
        limit: u64,
    ) -> Result<Self> {
        validate_sector_size(config, sector_size)?;

        if size_bytes == 0 {
            return Err(VdiskError::invalid("device size must be > 0"));
        }
        if size_bytes % u64::from(sector_size) != 0 {
            return Err(VdiskError::invalid(format!(
                "device size {size_bytes} is not a multiple of sector size {sector_size}"
            )));
        }
        if size_bytes > limit {
            return Err(VdiskError::invalid(format!(
                "device size {size_bytes} exceeds the limit of {limit} bytes for this kind"
            )));
        }

        Ok(Self {
            sector_size,
            sector_count: size_bytes / u64::from(sector_size),
        })
    }

    /// Total capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.sector_count * u64::from(self.sector_size)
    }

    /// Byte offset of `sector`.
    pub fn byte_offset(&self, sector: u64) -> u64 {
        sector * u64::from(self.sector_size)
    }

    /// Checks that `[start, start + count)` lies within the device.
    ///
    /// # Errors
    ///
    /// Returns [`VdiskError::OutOfRange`] otherwise, including on overflow.
    pub fn check_range(&self, start: u64, count: u64) -> Result<()> {
        match start.checked_add(count) {
            Some(end) if end <= self.sector_count => Ok(()),
            end => Err(VdiskError::OutOfRange {
                start,
                end: end.unwrap_or(u64::MAX),
                capacity: self.sector_count,
            }),
        }
    }
}

/// Rejects sector sizes the configuration does not allow.
///
/// # Errors
///
/// Returns [`VdiskError::InvalidParameter`] if `sector_size` is not a power
/// of two within `[min_sector_size, max_sector_size]`.
pub fn validate_sector_size(config: &ManagerConfig, sector_size: u32) -> Result<()> {
    if config.accepts_sector_size(sector_size) {
        Ok(())
    } else {
        Err(VdiskError::invalid(format!(
            "sector size {sector_size} must be a power of two in {}..={}",
            config.min_sector_size, config.max_sector_size
        )))
    }
}
