//! Disk-space admission control for the temporary data volume.
//!
//! The reserve is fixed at construction from the volume size; each check
//! reads live free space and admits work only while it stays above it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysinfo::Disks;

use crate::config::StorageConfig;
use crate::storage::{StorageError, StorageResult};

const ONE_GB: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Source of volume usage figures
pub trait DiskProbe: Send + Sync + std::fmt::Debug {
    fn space(&self) -> StorageResult<DiskSpace>;
}

/// Capacity checks consulted before accepting new work
pub trait AdmissionGate: Send + Sync {
    fn has_space_for_store(&self) -> bool;
    fn has_space_for_export(&self) -> bool;
    fn has_space_for_retrieve(&self) -> bool;
}

/// Probe backed by `sysinfo`, resolving the volume that holds `path`
#[derive(Debug, Clone)]
pub struct SysinfoDiskProbe {
    path: PathBuf,
}

impl SysinfoDiskProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DiskProbe for SysinfoDiskProbe {
    fn space(&self) -> StorageResult<DiskSpace> {
        let path = std::fs::canonicalize(&self.path)?;
        let disks = Disks::new_with_refreshed_list();

        // Longest mount point containing the path wins
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| DiskSpace {
                total_bytes: disk.total_space(),
                available_bytes: disk.available_space(),
            })
            .ok_or_else(|| {
                StorageError::Config(format!("no mounted volume holds '{}'", path.display()))
            })
    }
}

#[derive(Debug)]
pub struct StorageAdmission {
    probe: Arc<dyn DiskProbe>,
    temporary_data_dir: PathBuf,
    watermark_percent: u8,
    reserve_space_gb: u64,
    reserved_bytes: u64,
}

impl StorageAdmission {
    /// Build the controller for the configured temporary directory.
    ///
    /// The directory is created if missing so the volume can be resolved.
    pub fn new(config: &StorageConfig, probe: Arc<dyn DiskProbe>) -> StorageResult<Self> {
        if !(1..=100).contains(&config.watermark_percent) {
            return Err(StorageError::Config(format!(
                "watermark_percent must be between 1 and 100, got {}",
                config.watermark_percent
            )));
        }
        std::fs::create_dir_all(&config.temporary_data_dir)?;

        let space = probe.space()?;
        let reserved_bytes =
            reserved_bytes(space.total_bytes, config.watermark_percent, config.reserve_space_gb);

        tracing::info!(
            path = %config.temporary_data_dir.display(),
            total_bytes = space.total_bytes,
            reserved_bytes,
            "Storage admission initialised"
        );

        Ok(Self {
            probe,
            temporary_data_dir: config.temporary_data_dir.clone(),
            watermark_percent: config.watermark_percent,
            reserve_space_gb: config.reserve_space_gb,
            reserved_bytes,
        })
    }

    /// Use the `sysinfo` probe for the configured directory
    pub fn from_config(config: &StorageConfig) -> StorageResult<Self> {
        std::fs::create_dir_all(&config.temporary_data_dir)?;
        let probe = Arc::new(SysinfoDiskProbe::new(&config.temporary_data_dir));
        Self::new(config, probe)
    }

    pub fn temporary_data_dir(&self) -> &Path {
        &self.temporary_data_dir
    }

    pub fn reserved_bytes(&self) -> u64 {
        self.reserved_bytes
    }

    /// Live free bytes on the volume; 0 when the probe fails
    pub fn available_free_space(&self) -> u64 {
        match self.probe.space() {
            Ok(space) => space.available_bytes,
            Err(e) => {
                tracing::error!("Unable to read free space for {}: {}", self.temporary_data_dir.display(), e);
                0
            }
        }
    }

    fn is_space_available(&self) -> bool {
        let free = self.available_free_space();
        if free > self.reserved_bytes {
            return true;
        }
        tracing::info!(
            free_bytes = free,
            reserved_bytes = self.reserved_bytes,
            watermark_percent = self.watermark_percent,
            reserve_space_gb = self.reserve_space_gb,
            "Storage space at or below the reserved threshold"
        );
        false
    }
}

impl AdmissionGate for StorageAdmission {
    fn has_space_for_store(&self) -> bool {
        self.is_space_available()
    }

    fn has_space_for_export(&self) -> bool {
        self.is_space_available()
    }

    fn has_space_for_retrieve(&self) -> bool {
        self.is_space_available()
    }
}

/// `max(total * (1 - watermark / 100), reserve_gb * 1e9)`
fn reserved_bytes(total_bytes: u64, watermark_percent: u8, reserve_space_gb: u64) -> u64 {
    let above_watermark = total_bytes as f64 * (1.0 - f64::from(watermark_percent) / 100.0);
    let reserve = reserve_space_gb as f64 * ONE_GB;
    above_watermark.max(reserve) as u64
}
