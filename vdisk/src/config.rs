//! Manager-wide limits.
//!
//! A [`ManagerConfig`] is fixed when the registry is loaded. It bounds the
//! sector sizes, device count and per-kind backing sizes that `create` will
//! accept, and sets the allocation granule of memory-backed devices. It can
//! be built in code, deserialized from JSON, or loaded from a file.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Smallest sector size any configuration may allow.
const SECTOR_SIZE_FLOOR: u32 = 512;

/// Largest sector size any configuration may allow (1 MiB).
const SECTOR_SIZE_CEILING: u32 = 1 << 20;

/// Hard upper bound on attached devices.
const DEVICE_COUNT_CEILING: u32 = 4096;

/// Limits applied by the registry when creating devices.
///
/// # Example
///
/// ```rust
/// use vdisk::config::ManagerConfig;
///
/// let config: ManagerConfig = serde_json::from_str(r#"{ "max_devices": 8 }"#).unwrap();
/// assert_eq!(config.max_devices, 8);
/// assert_eq!(config.min_sector_size, 512);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Smallest accepted sector size in bytes (power of two).
    pub min_sector_size: u32,
    /// Largest accepted sector size in bytes (power of two).
    pub max_sector_size: u32,
    /// Identities are drawn from `0..max_devices`.
    pub max_devices: u32,
    /// Largest memory-backed device in bytes.
    pub max_memory_bytes: u64,
    /// Largest swap-backed device in bytes.
    pub max_swap_bytes: u64,
    /// Allocation granule of memory-backed devices in bytes (power of two).
    pub memory_chunk_size: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            min_sector_size: 512,
            max_sector_size: 65_536,
            max_devices: 64,
            max_memory_bytes: 1 << 30,
            max_swap_bytes: 4 << 30,
            memory_chunk_size: 64 * 1024,
        }
    }
}

impl ManagerConfig {
    /// Loads a configuration from a JSON file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`] if the file
    /// cannot be used, and [`ConfigError::InvalidValue`] if it fails
    /// validation.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every limit is internally consistent.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        check_power_of_two("min_sector_size", self.min_sector_size)?;
        check_power_of_two("max_sector_size", self.max_sector_size)?;
        check_power_of_two("memory_chunk_size", self.memory_chunk_size)?;

        if self.min_sector_size < SECTOR_SIZE_FLOOR {
            return Err(invalid(
                "min_sector_size",
                format!("{} is below {SECTOR_SIZE_FLOOR}", self.min_sector_size),
            ));
        }
        if self.max_sector_size > SECTOR_SIZE_CEILING {
            return Err(invalid(
                "max_sector_size",
                format!("{} exceeds {SECTOR_SIZE_CEILING}", self.max_sector_size),
            ));
        }
        if self.min_sector_size > self.max_sector_size {
            return Err(invalid(
                "min_sector_size",
                format!(
                    "{} is larger than max_sector_size {}",
                    self.min_sector_size, self.max_sector_size
                ),
            ));
        }
        // Chunks must hold whole sectors so a sector never straddles two chunks.
        if self.memory_chunk_size < self.max_sector_size {
            return Err(invalid(
                "memory_chunk_size",
                format!(
                    "{} is smaller than max_sector_size {}",
                    self.memory_chunk_size, self.max_sector_size
                ),
            ));
        }
        if self.max_devices == 0 || self.max_devices > DEVICE_COUNT_CEILING {
            return Err(invalid(
                "max_devices",
                format!("{} is outside 1..={DEVICE_COUNT_CEILING}", self.max_devices),
            ));
        }
        if self.max_memory_bytes == 0 {
            return Err(invalid("max_memory_bytes", "must be > 0".to_string()));
        }
        if self.max_swap_bytes == 0 {
            return Err(invalid("max_swap_bytes", "must be > 0".to_string()));
        }

        Ok(())
    }

    /// Returns true if `sector_size` is a power of two within the configured range.
    pub fn accepts_sector_size(&self, sector_size: u32) -> bool {
        sector_size.is_power_of_two()
            && (self.min_sector_size..=self.max_sector_size).contains(&sector_size)
    }
}

fn check_power_of_two(field: &'static str, value: u32) -> Result<()> {
    if value.is_power_of_two() {
        Ok(())
    } else {
        Err(invalid(field, format!("{value} is not a power of two")))
    }
}

fn invalid(field: &'static str, reason: String) -> crate::error::VdiskError {
    ConfigError::InvalidValue { field, reason }.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VdiskError;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        ManagerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_sector_size_acceptance() {
        let config = ManagerConfig::default();
        assert!(config.accepts_sector_size(512));
        assert!(config.accepts_sector_size(4096));
        assert!(config.accepts_sector_size(65_536));
        assert!(!config.accepts_sector_size(256));
        assert!(!config.accepts_sector_size(1000));
        assert!(!config.accepts_sector_size(131_072));
        assert!(!config.accepts_sector_size(0));
    }

    #[test]
    fn test_rejects_inverted_sector_bounds() {
        let config = ManagerConfig {
            min_sector_size: 4096,
            max_sector_size: 512,
            ..ManagerConfig::default()
        };
        match config.validate().unwrap_err() {
            VdiskError::Config(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "min_sector_size");
            }
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_chunk_smaller_than_sector() {
        let config = ManagerConfig {
            memory_chunk_size: 4096,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_devices() {
        let config = ManagerConfig {
            max_devices: 0,
            ..ManagerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vdisk.json");
        std::fs::write(&path, r#"{ "max_devices": 3, "max_memory_bytes": 1048576 }"#).unwrap();

        let config = ManagerConfig::load(&path).unwrap();
        assert_eq!(config.max_devices, 3);
        assert_eq!(config.max_memory_bytes, 1_048_576);
        assert_eq!(config.max_sector_size, 65_536);
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        match ManagerConfig::load(&path).unwrap_err() {
            VdiskError::Config(ConfigError::Parse { .. }) => {}
            other => panic!("expected Parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        match ManagerConfig::load(dir.path().join("absent.json")).unwrap_err() {
            VdiskError::Config(ConfigError::Read { .. }) => {}
            other => panic!("expected Read error, got {other:?}"),
        }
    }
}
