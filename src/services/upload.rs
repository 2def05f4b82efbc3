//! Upload worker pool moving payload files into durable storage.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::models::{FileRecord, StorageObject};
use crate::queue::{QueueError, WorkQueue};
use crate::retry::{with_retry_cancellable, Cancelled};
use crate::storage::{ObjectMetadata, ObjectStore, StorageError};

pub const METADATA_SOURCE: &str = "source";
pub const METADATA_WORKFLOWS: &str = "workflows";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file {0} is not part of a payload")]
    Unassigned(Uuid),
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("object '{key}' not found after {attempts} verification attempts")]
    VerificationFailed { key: String, attempts: u32 },
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub bucket: String,
    pub workers: usize,
    pub retry_delays: Vec<Duration>,
    pub verify_attempts: u32,
    pub verify_delay: Duration,
}

impl From<&StorageConfig> for UploadSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            bucket: config.bucket.clone(),
            workers: config.concurrent_uploads,
            retry_delays: config.retries.delays(),
            verify_attempts: config.verify_attempts,
            verify_delay: config.verify_delay(),
        }
    }
}

#[derive(Debug)]
pub struct UploadService {
    store: Arc<dyn ObjectStore>,
    uploads: WorkQueue<Arc<FileRecord>>,
    cleanup: WorkQueue<Arc<FileRecord>>,
    settings: UploadSettings,
}

impl UploadService {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        uploads: WorkQueue<Arc<FileRecord>>,
        cleanup: WorkQueue<Arc<FileRecord>>,
        settings: UploadSettings,
    ) -> Self {
        Self {
            store,
            uploads,
            cleanup,
            settings,
        }
    }

    /// Spawn `settings.workers` workers draining the upload queue
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        tracing::info!("Starting {} upload workers", self.settings.workers);
        (0..self.settings.workers)
            .map(|worker| {
                let service = self.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { service.run_worker(worker, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let record = match self.uploads.dequeue(&cancel).await {
                Ok(record) => record,
                Err(QueueError::Cancelled) => {
                    tracing::debug!("Upload worker {} cancelled", worker);
                    break;
                }
                Err(QueueError::Closed) => break,
            };

            match self.process(&record, &cancel).await {
                Ok(()) => {
                    if let Err(e) = self.cleanup.enqueue(record.clone()) {
                        tracing::error!("Unable to queue {} for cleanup: {}", record.id, e);
                    }
                }
                Err(e) => {
                    tracing::error!(
                        file_id = %record.id,
                        payload_id = ?record.payload_id(),
                        "Upload failed, keeping local copy: {}",
                        e
                    );
                }
            }
        }
    }

    /// Upload the record's objects, sidecar first.
    ///
    /// An object that cannot be written or verified is flagged `upload_failed`.
    #[tracing::instrument(skip_all, fields(file_id = %record.id))]
    pub async fn process(&self, record: &FileRecord, cancel: &CancellationToken) -> Result<(), UploadError> {
        if record.is_uploaded() {
            tracing::debug!("Already uploaded, skipping");
            return Ok(());
        }

        for object in record.upload_order() {
            if object.is_uploaded() {
                continue;
            }
            if let Err(e) = self.upload_object(record, object, cancel).await {
                object.mark_upload_failed();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn upload_object(
        &self,
        record: &FileRecord,
        object: &StorageObject,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let key = record
            .upload_key(object)
            .ok_or(UploadError::Unassigned(record.id))?;
        let data = object.read_bytes().await.map_err(|source| UploadError::Read {
            path: object.temporary_path.clone(),
            source,
        })?;

        let mut metadata = ObjectMetadata::new();
        metadata.insert(METADATA_SOURCE.to_string(), record.source.clone());
        metadata.insert(METADATA_WORKFLOWS.to_string(), record.workflows.join(","));

        let bucket = self.settings.bucket.as_str();
        with_retry_cancellable(
            "upload",
            &self.settings.retry_delays,
            cancel,
            StorageError::is_transient,
            || {
                let data = data.clone();
                let metadata = &metadata;
                let key = key.as_str();
                async move {
                    let result = self
                        .store
                        .put(bucket, key, data, &object.content_type, metadata)
                        .await;
                    if result.is_err() {
                        object.increment_retry();
                    }
                    result
                }
            },
        )
        .await?;

        self.verify(&key, cancel).await?;
        object.mark_uploaded();
        object.mark_moved();
        tracing::debug!("Uploaded {}/{}", bucket, key);
        Ok(())
    }

    async fn verify(&self, key: &str, cancel: &CancellationToken) -> Result<(), UploadError> {
        let attempts = self.settings.verify_attempts.max(1);
        for attempt in 1..=attempts {
            let exists = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled(format!("verification of {}", key)).into()),
                exists = self.store.exists(&self.settings.bucket, key) => exists,
            };
            match exists {
                Ok(true) => return Ok(()),
                Ok(false) => tracing::warn!("{} not yet visible (check {} of {})", key, attempt, attempts),
                Err(e) => tracing::warn!("Existence check {} of {} for {} failed: {}", attempt, attempts, key, e),
            }
            if attempt < attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Cancelled(format!("verification of {}", key)).into()),
                    _ = tokio::time::sleep(self.settings.verify_delay) => {}
                }
            }
        }
        Err(UploadError::VerificationFailed {
            key: key.to_string(),
            attempts,
        })
    }
}
