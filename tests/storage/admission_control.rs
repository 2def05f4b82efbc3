#[path = "../common/mod.rs"]
mod common;

use std::sync::Arc;

use common::{FixedDiskProbe, GB};
use imaging_gateway::config::StorageConfig;
use imaging_gateway::storage::{AdmissionGate, StorageAdmission};
use tempfile::TempDir;

fn storage_config(dir: &TempDir, watermark_percent: u8, reserve_space_gb: u64) -> StorageConfig {
    StorageConfig {
        temporary_data_dir: dir.path().join("tmp"),
        watermark_percent,
        reserve_space_gb,
        ..Default::default()
    }
}

#[test]
fn test_watermark_dominates_on_large_volumes() {
    let dir = TempDir::new().unwrap();
    let probe = FixedDiskProbe::new(100 * GB, 10 * GB);
    let admission = StorageAdmission::new(&storage_config(&dir, 75, 5), probe.clone()).unwrap();

    assert_eq!(admission.reserved_bytes(), 25 * GB);
    assert!(!admission.has_space_for_export());
    assert!(!admission.has_space_for_store());
    assert!(!admission.has_space_for_retrieve());

    probe.set_available(30 * GB);
    assert!(admission.has_space_for_export());
    assert!(admission.has_space_for_store());
    assert!(admission.has_space_for_retrieve());
}

#[test]
fn test_fixed_reserve_dominates_on_small_volumes() {
    let dir = TempDir::new().unwrap();
    let probe = FixedDiskProbe::new(100 * GB, 6 * GB);
    let admission = StorageAdmission::new(&storage_config(&dir, 99, 5), probe.clone()).unwrap();

    assert_eq!(admission.reserved_bytes(), 5 * GB);
    assert!(admission.has_space_for_store());

    // Exactly at the reserve is not enough
    probe.set_available(5 * GB);
    assert!(!admission.has_space_for_store());
}

#[test]
fn test_free_space_is_read_live() {
    let dir = TempDir::new().unwrap();
    let probe = FixedDiskProbe::new(10 * GB, 9 * GB);
    let admission = StorageAdmission::new(&storage_config(&dir, 50, 1), probe.clone()).unwrap();

    assert_eq!(admission.available_free_space(), 9 * GB);
    assert!(admission.has_space_for_export());
    probe.set_available(2 * GB);
    assert_eq!(admission.available_free_space(), 2 * GB);
    assert!(!admission.has_space_for_export());
}

#[test]
fn test_creates_the_temporary_directory() {
    let dir = TempDir::new().unwrap();
    let config = storage_config(&dir, 75, 5);
    StorageAdmission::new(&config, FixedDiskProbe::new(100 * GB, 50 * GB)).unwrap();
    assert!(config.temporary_data_dir.is_dir());
}

#[test]
fn test_rejects_out_of_range_watermark() {
    let dir = TempDir::new().unwrap();
    for watermark in [0, 101] {
        let probe: Arc<FixedDiskProbe> = FixedDiskProbe::new(100 * GB, 50 * GB);
        assert!(StorageAdmission::new(&storage_config(&dir, watermark, 5), probe).is_err());
    }
}
