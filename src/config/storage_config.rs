use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConfigError, RetryConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Where front ends write received files before upload
    #[serde(default = "default_temporary_data_dir")]
    pub temporary_data_dir: PathBuf,
    /// Root of the filesystem object store used in standalone mode
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Percentage of the volume that may be used before ingestion is refused
    #[serde(default = "default_watermark_percent")]
    pub watermark_percent: u8,
    /// Minimum free space to keep, in GB
    #[serde(default = "default_reserve_space_gb")]
    pub reserve_space_gb: u64,
    #[serde(default = "default_concurrent_uploads")]
    pub concurrent_uploads: usize,
    #[serde(default = "default_payload_timeout_secs")]
    pub payload_timeout_secs: u64,
    #[serde(default = "default_payload_check_interval_ms")]
    pub payload_check_interval_ms: u64,
    #[serde(default = "default_verify_attempts")]
    pub verify_attempts: u32,
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    #[serde(default)]
    pub retries: RetryConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temporary_data_dir: default_temporary_data_dir(),
            storage_root: default_storage_root(),
            bucket: default_bucket(),
            watermark_percent: default_watermark_percent(),
            reserve_space_gb: default_reserve_space_gb(),
            concurrent_uploads: default_concurrent_uploads(),
            payload_timeout_secs: default_payload_timeout_secs(),
            payload_check_interval_ms: default_payload_check_interval_ms(),
            verify_attempts: default_verify_attempts(),
            verify_delay_ms: default_verify_delay_ms(),
            retries: RetryConfig::default(),
        }
    }
}

impl StorageConfig {
    pub fn payload_timeout(&self) -> Duration {
        Duration::from_secs(self.payload_timeout_secs)
    }

    pub fn payload_check_interval(&self) -> Duration {
        Duration::from_millis(self.payload_check_interval_ms)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.watermark_percent) {
            return Err(ConfigError::InvalidWatermark(self.watermark_percent));
        }
        if self.bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.bucket cannot be empty".into()));
        }
        if self.concurrent_uploads == 0 {
            return Err(ConfigError::ZeroWorkers("storage.concurrent_uploads".into()));
        }
        if self.payload_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "storage.payload_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.payload_check_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "storage.payload_check_interval_ms must be greater than 0".into(),
            ));
        }
        if self.verify_attempts == 0 {
            return Err(ConfigError::Invalid(
                "storage.verify_attempts must be at least 1".into(),
            ));
        }
        self.retries.validate("storage.retries")
    }
}

fn default_temporary_data_dir() -> PathBuf {
    PathBuf::from("./tmp/gateway")
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data/storage")
}

fn default_bucket() -> String {
    "gateway".to_string()
}

fn default_watermark_percent() -> u8 {
    75
}

fn default_reserve_space_gb() -> u64 {
    5
}

fn default_concurrent_uploads() -> usize {
    2
}

fn default_payload_timeout_secs() -> u64 {
    5
}

fn default_payload_check_interval_ms() -> u64 {
    1000
}

fn default_verify_attempts() -> u32 {
    3
}

fn default_verify_delay_ms() -> u64 {
    250
}
