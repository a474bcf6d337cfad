//! Device naming for the daemon: names are announced in the log.

use std::collections::BTreeMap;
use std::io;

use parking_lot::Mutex;
use vdisk::{DeviceId, DeviceNamer, DeviceSummary};

/// Logs every published and withdrawn device name.
///
/// Keeps the set of live names so a double publish is refused, which unwinds
/// the attach that caused it.
#[derive(Debug, Default)]
pub struct LoggingNamer {
    names: Mutex<BTreeMap<DeviceId, String>>,
}

impl LoggingNamer {
    /// Creates a namer with no published names.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently published names, ordered by identity.
    #[cfg(test)]
    pub fn published(&self) -> Vec<String> {
        self.names.lock().values().cloned().collect()
    }
}

impl DeviceNamer for LoggingNamer {
    fn publish(&self, summary: &DeviceSummary) -> io::Result<()> {
        let mut names = self.names.lock();
        if names.contains_key(&summary.id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("name {} is already published", summary.name),
            ));
        }
        tracing::info!(
            "published {} ({}, {} x {} bytes{})",
            summary.name,
            summary.kind,
            summary.sector_count,
            summary.sector_size,
            if summary.read_only { ", read-only" } else { "" },
        );
        names.insert(summary.id, summary.name.clone());
        Ok(())
    }

    fn unpublish(&self, id: DeviceId) {
        match self.names.lock().remove(&id) {
            Some(name) => tracing::info!("withdrew {name}"),
            None => tracing::warn!("withdrawing unknown device {id}"),
        }
    }
}
