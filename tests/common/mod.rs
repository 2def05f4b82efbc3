#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use imaging_gateway::config::{Config, RetryConfig};
use imaging_gateway::export::{DeliveryError, ExportTransport};
use imaging_gateway::models::{DicomIdentity, ExportRequestDataMessage, ExportRequestEvent, FileRecord, Message};
use imaging_gateway::storage::{
    AdmissionGate, DiskProbe, DiskSpace, ObjectInfo, ObjectMetadata, ObjectStore, StorageError, StorageResult,
};

pub const GB: u64 = 1_000_000_000;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub content_type: String,
    pub metadata: ObjectMetadata,
}

/// In-memory object store with failure injection
#[derive(Debug, Default)]
pub struct MockObjectStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    failing_puts: AtomicU32,
    failing_gets: AtomicU32,
    /// `exists` reports false even for stored objects
    hide_objects: AtomicBool,
    pub put_calls: AtomicU32,
    pub exists_calls: AtomicU32,
}

impl MockObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_puts(&self, count: u32) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_gets(&self, count: u32) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    pub fn hide_objects(&self, hide: bool) {
        self.hide_objects.store(hide, Ordering::SeqCst);
    }

    pub fn insert(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data: data.into(),
                content_type: "application/octet-stream".into(),
                metadata: ObjectMetadata::new(),
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_puts) {
            return Err(StorageError::Unavailable("injected put failure".into()));
        }
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                content_type: content_type.to_string(),
                metadata: metadata.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        if Self::take_failure(&self.failing_gets) {
            return Err(StorageError::Unavailable("injected get failure".into()));
        }
        self.object(bucket, key)
            .map(|o| o.data)
            .ok_or_else(|| StorageError::not_found(bucket, key))
    }

    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        if self.hide_objects.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.object(bucket, key).is_some())
    }

    async fn list(&self, bucket: &str, prefix: &str, _recursive: bool) -> StorageResult<Vec<ObjectInfo>> {
        let objects = self.objects.lock().unwrap();
        Ok(objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, k), o)| ObjectInfo {
                key: k.clone(),
                size: o.data.len() as u64,
                content_type: o.content_type.clone(),
                metadata: o.metadata.clone(),
                last_modified: Utc::now(),
            })
            .collect())
    }
}

/// Disk probe reporting whatever the test sets
#[derive(Debug)]
pub struct FixedDiskProbe {
    pub total: AtomicU64,
    pub available: AtomicU64,
}

impl FixedDiskProbe {
    pub fn new(total: u64, available: u64) -> Arc<Self> {
        Arc::new(Self {
            total: AtomicU64::new(total),
            available: AtomicU64::new(available),
        })
    }

    pub fn set_available(&self, available: u64) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl DiskProbe for FixedDiskProbe {
    fn space(&self) -> StorageResult<DiskSpace> {
        Ok(DiskSpace {
            total_bytes: self.total.load(Ordering::SeqCst),
            available_bytes: self.available.load(Ordering::SeqCst),
        })
    }
}

/// Admission gate toggled directly by tests
#[derive(Debug, Default)]
pub struct SwitchGate {
    pub full: AtomicBool,
}

impl AdmissionGate for SwitchGate {
    fn has_space_for_store(&self) -> bool {
        !self.full.load(Ordering::SeqCst)
    }

    fn has_space_for_export(&self) -> bool {
        !self.full.load(Ordering::SeqCst)
    }

    fn has_space_for_retrieve(&self) -> bool {
        !self.full.load(Ordering::SeqCst)
    }
}

/// Transport that records deliveries and fails on demand
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub delivered: Mutex<Vec<(String, String)>>,
    pub attempts: AtomicU32,
    known: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, DeliveryError>>,
    transient_failures: AtomicU32,
    delay: Mutex<Option<Duration>>,
}

impl RecordingTransport {
    pub fn with_destinations(names: &[&str]) -> Self {
        let transport = Self::default();
        *transport.known.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
        transport
    }

    /// Every delivery of `file_id` fails with `error`
    pub fn fail_file(&self, file_id: &str, error: DeliveryError) {
        self.failures.lock().unwrap().insert(file_id.to_string(), error);
    }

    pub fn fail_next_attempts(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn delivered(&self) -> Vec<(String, String)> {
        let mut delivered = self.delivered.lock().unwrap().clone();
        delivered.sort();
        delivered
    }
}

#[async_trait]
impl ExportTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(
        &self,
        destination: &str,
        message: &ExportRequestDataMessage,
        _data: &Bytes,
    ) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.known.lock().unwrap().iter().any(|n| n == destination) {
            return Err(DeliveryError::unknown_destination(destination));
        }
        if let Some(error) = self.failures.lock().unwrap().get(&message.file_id) {
            return Err(error.clone());
        }
        if MockObjectStore::take_failure(&self.transient_failures) {
            return Err(DeliveryError::Transport("connection reset".into()));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((destination.to_string(), message.file_id.clone()));
        Ok(())
    }
}

/// Configuration with short timers rooted in `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.temporary_data_dir = dir.join("tmp");
    config.storage.storage_root = dir.join("storage");
    config.storage.payload_timeout_secs = 1;
    config.storage.payload_check_interval_ms = 50;
    config.storage.verify_delay_ms = 10;
    config.storage.retries = RetryConfig::from_millis(vec![10, 10, 10]);
    config.messaging.retries = RetryConfig::from_millis(vec![10, 10, 10]);
    config.export.retries = RetryConfig::from_millis(vec![10, 10]);
    config.export.shutdown_timeout_secs = 5;
    config
}

pub fn dicom_record(temp_root: &Path, association: &str, sop: &str) -> FileRecord {
    FileRecord::dicom(
        temp_root,
        DicomIdentity {
            association_id: association.into(),
            calling_ae_title: "MODALITY".into(),
            called_ae_title: "GATEWAY".into(),
            study_instance_uid: "1.2.3".into(),
            series_instance_uid: "1.2.3.4".into(),
            sop_instance_uid: sop.into(),
        },
    )
    .with_correlation_id(association)
    .with_workflows(["ai-triage"])
    .with_data(part10(sop.as_bytes()))
    .with_sidecar_data(format!("{{\"sop\":\"{}\"}}", sop))
}

/// Minimal part-10 shaped bytes: preamble, magic, then `body`
pub fn part10(body: &[u8]) -> Bytes {
    let mut data = vec![0u8; 128];
    data.extend_from_slice(b"DICM");
    data.extend_from_slice(body);
    Bytes::from(data)
}

pub fn export_request(task_id: &str, files: &[&str], destinations: &[&str]) -> ExportRequestEvent {
    ExportRequestEvent {
        export_task_id: task_id.to_string(),
        workflow_instance_id: format!("wf-{}", task_id),
        correlation_id: format!("corr-{}", task_id),
        files: files.iter().map(|f| f.to_string()).collect(),
        destinations: destinations.iter().map(|d| d.to_string()).collect(),
        plugins: Vec::new(),
    }
}

pub fn request_message(request: &ExportRequestEvent) -> Message {
    Message::json(request, request.correlation_id.clone()).unwrap()
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
