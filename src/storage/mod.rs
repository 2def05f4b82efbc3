use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub mod admission;
pub mod filesystem;

pub use admission::{AdmissionGate, DiskProbe, DiskSpace, StorageAdmission, SysinfoDiskProbe};
pub use filesystem::FilesystemObjectStore;

/// Object metadata stored alongside the content
pub type ObjectMetadata = HashMap<String, String>;

/// Error type for storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Path error: {0}")]
    Path(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Object '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
    #[error("Storage service unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Cancelled(#[from] crate::retry::Cancelled),
}

impl StorageError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Whether another attempt may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io(e) => e.kind() != std::io::ErrorKind::NotFound,
            StorageError::Unavailable(_) => true,
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Listing entry returned by [`ObjectStore::list`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub content_type: String,
    pub metadata: ObjectMetadata,
    pub last_modified: DateTime<Utc>,
}

/// Durable object storage the upload workers write to and exports read from
///
/// Implementations report failures; retrying is the caller's job.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Write `data` under `key`. Only returns Ok once the write is durable.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<()>;

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes>;

    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool>;

    /// Objects whose key starts with `prefix`; without `recursive` only the
    /// level directly below the prefix is returned
    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> StorageResult<Vec<ObjectInfo>>;
}

/// Reject keys that would escape the bucket
pub(crate) fn validate_key(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == ".." || part.is_empty()) {
        return Err(StorageError::Path(format!("invalid object key '{}'", key)));
    }
    Ok(())
}
