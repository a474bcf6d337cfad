//! Backing stores: where a device's bytes physically live.
//!
//! Every device owns exactly one [`BackingStore`], chosen at creation from
//! [`BackingKind`] and fixed for the device's lifetime. The worker is written
//! once against the trait; it never needs to know which variant it drives.
//!
//! - [`memory::MemoryBacking`]: lazily allocated, zero-filled heap chunks
//! - [`file::FileBacking`]: seek-and-transfer I/O against an existing file
//! - [`swap::SwapBacking`]: anonymous mapping paged by the OS
//!
//! Offsets and lengths handed to a store have already been checked against
//! the device geometry; stores still refuse out-of-bounds access with
//! [`std::io::ErrorKind::InvalidInput`] rather than panicking.

pub mod file;
pub mod memory;
pub mod swap;

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use file::FileBacking;
pub use memory::MemoryBacking;
pub use swap::SwapBacking;

/// Which backing medium a device uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackingKind {
    /// Heap memory owned by the manager.
    Memory,
    /// An existing file on a host filesystem.
    File,
    /// Anonymous pages supplied by the OS pager.
    Swap,
}

impl BackingKind {
    /// Lowercase name, as used in configuration and the control API.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Swap => "swap",
        }
    }
}

impl fmt::Display for BackingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "malloc" => Ok(Self::Memory),
            "file" | "vnode" => Ok(Self::File),
            "swap" => Ok(Self::Swap),
            other => Err(format!(
                "unknown backing kind '{other}' (expected memory, file or swap)"
            )),
        }
    }
}

/// Capability set shared by every backing medium.
///
/// A store is driven by a single worker thread at a time, so methods take
/// `&mut self` and implementations need no interior locking.
pub trait BackingStore: Send + fmt::Debug {
    /// The variant of this store.
    fn kind(&self) -> BackingKind;

    /// Fixed capacity in bytes.
    fn capacity_bytes(&self) -> u64;

    /// Bytes currently held by the medium (allocated chunks, file length,
    /// or written pages of a mapping).
    fn resident_bytes(&self) -> u64;

    /// Fills `dest` with the bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the medium fails or the range is out of bounds.
    fn read_into(&mut self, dest: &mut [u8], offset: u64) -> io::Result<()>;

    /// Stores all of `src` starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the medium fails or the range is out of bounds.
    fn write_from(&mut self, src: &[u8], offset: u64) -> io::Result<()>;

    /// Makes previously written data durable on the medium.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the medium cannot be synchronised.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Discards `len` bytes at `offset`; they read back as zeros afterwards.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the medium fails or the range is out of bounds.
    fn discard(&mut self, offset: u64, len: u64) -> io::Result<()>;

    /// Gives every resource back to the system.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if outstanding data could not be made durable.
    fn release(self: Box<Self>) -> io::Result<()>;
}

/// Validates `[offset, offset + len)` against `capacity` and returns the end.
pub(crate) fn check_bounds(offset: u64, len: u64, capacity: u64) -> io::Result<u64> {
    match offset.checked_add(len) {
        Some(end) if end <= capacity => Ok(end),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("access {offset}+{len} exceeds backing capacity {capacity}"),
        )),
    }
}
