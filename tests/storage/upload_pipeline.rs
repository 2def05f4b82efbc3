#[path = "../common/mod.rs"]
mod common;

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, MockObjectStore};
use imaging_gateway::models::{DicomIdentity, FileRecord};
use imaging_gateway::queue::WorkQueue;
use imaging_gateway::services::{SpaceReclaimer, UploadError, UploadService, UploadSettings};
use imaging_gateway::storage::FilesystemObjectStore;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const BUCKET: &str = "gateway";

fn settings() -> UploadSettings {
    UploadSettings {
        bucket: BUCKET.to_string(),
        workers: 1,
        retry_delays: vec![Duration::from_millis(10); 3],
        verify_attempts: 3,
        verify_delay: Duration::from_millis(10),
    }
}

fn service(store: Arc<MockObjectStore>) -> (UploadService, WorkQueue<Arc<FileRecord>>, WorkQueue<Arc<FileRecord>>) {
    let uploads = WorkQueue::new();
    let cleanup = WorkQueue::new();
    (
        UploadService::new(store, uploads.clone(), cleanup.clone(), settings()),
        uploads,
        cleanup,
    )
}

/// A DICOM record whose content and sidecar exist on disk under `root`
async fn record_on_disk(root: &Path, sop: &str) -> FileRecord {
    let record = FileRecord::dicom(
        root,
        DicomIdentity {
            association_id: "assoc".into(),
            calling_ae_title: "CT01".into(),
            called_ae_title: "GATEWAY".into(),
            study_instance_uid: "1.2".into(),
            series_instance_uid: "1.2.3".into(),
            sop_instance_uid: sop.into(),
        },
    )
    .with_workflows(["routing", "ai"]);
    let parent = record.file.temporary_path.parent().unwrap();
    tokio::fs::create_dir_all(parent).await.unwrap();
    tokio::fs::write(&record.file.temporary_path, b"dicom").await.unwrap();
    let sidecar = record.sidecar.as_ref().unwrap();
    tokio::fs::write(&sidecar.temporary_path, b"{}").await.unwrap();
    record.assign_payload(Uuid::new_v4());
    record
}

#[tokio::test]
async fn test_uploads_file_and_sidecar_with_metadata() {
    let dir = TempDir::new().unwrap();
    let store = MockObjectStore::new();
    let (service, _, _) = service(store.clone());
    let record = record_on_disk(dir.path(), "9.9").await;
    let payload_id = record.payload_id().unwrap();

    service.process(&record, &CancellationToken::new()).await.unwrap();

    assert!(record.is_uploaded());
    assert!(record.is_moved());
    assert!(record.file.date_uploaded().is_some());

    let key = format!("{}/dcm/1.2/1.2.3/9.9.dcm", payload_id);
    let object = store.object(BUCKET, &key).unwrap();
    assert_eq!(&object.data[..], b"dicom");
    assert_eq!(object.content_type, "application/dicom");
    assert_eq!(object.metadata.get("source").unwrap(), "CT01");
    assert_eq!(object.metadata.get("workflows").unwrap(), "routing,ai");

    let sidecar = store.object(BUCKET, &format!("{}.json", key)).unwrap();
    assert_eq!(&sidecar.data[..], b"{}");
    assert_eq!(sidecar.content_type, "application/json");
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let dir = TempDir::new().unwrap();
    let store = MockObjectStore::new();
    store.fail_next_puts(2);
    let (service, _, _) = service(store.clone());
    let record = record_on_disk(dir.path(), "1").await;

    service.process(&record, &CancellationToken::new()).await.unwrap();

    assert!(record.is_uploaded());
    assert_eq!(store.put_calls.load(Ordering::SeqCst), 4);
    // Sidecar goes first and absorbs both failures
    assert_eq!(record.sidecar.as_ref().unwrap().retry_count(), 2);
    assert_eq!(record.file.retry_count(), 0);
}

#[tokio::test]
async fn test_exhausted_write_retries_mark_upload_failed() {
    let dir = TempDir::new().unwrap();
    let store = MockObjectStore::new();
    store.fail_next_puts(10);
    let (service, _, _) = service(store.clone());
    let record = record_on_disk(dir.path(), "1").await;

    let err = service.process(&record, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, UploadError::Storage(_)));
    assert_eq!(store.put_calls.load(Ordering::SeqCst), 4);
    assert!(record.is_upload_failed());
    assert!(!record.is_uploaded());
    assert!(record.file.temporary_path.exists());
}

#[tokio::test]
async fn test_failed_verification_leaves_file_unuploaded_and_on_disk() {
    let dir = TempDir::new().unwrap();
    let store = MockObjectStore::new();
    store.hide_objects(true);
    let (service, uploads, cleanup) = service(store.clone());
    let service = Arc::new(service);
    let reclaimer = Arc::new(SpaceReclaimer::new(dir.path(), cleanup.clone()));

    let cancel = CancellationToken::new();
    let workers = service.clone().start(cancel.clone());
    let reclaim_worker = reclaimer.start(cancel.clone());

    let record = Arc::new(record_on_disk(dir.path(), "1").await);
    uploads.enqueue(record.clone()).unwrap();

    assert!(wait_for(Duration::from_secs(5), || record.is_upload_failed()).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(store.exists_calls.load(Ordering::SeqCst), 3);
    assert!(!record.is_uploaded());
    assert!(!record.is_moved());
    assert!(cleanup.is_empty());
    assert!(record.file.temporary_path.exists());
    assert!(record.sidecar.as_ref().unwrap().temporary_path.exists());

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
    reclaim_worker.await.unwrap();
}

#[tokio::test]
async fn test_verification_failure_is_reported() {
    let dir = TempDir::new().unwrap();
    let store = MockObjectStore::new();
    store.hide_objects(true);
    let (service, _, _) = service(store.clone());
    let record = record_on_disk(dir.path(), "1").await;

    let err = service.process(&record, &CancellationToken::new()).await.unwrap_err();
    match err {
        UploadError::VerificationFailed { attempts, key } => {
            assert_eq!(attempts, 3);
            assert!(key.ends_with(".json"));
        }
        other => panic!("unexpected error {}", other),
    }
}

#[tokio::test]
async fn test_verification_stops_on_cancel() {
    let dir = TempDir::new().unwrap();
    let store = MockObjectStore::new();
    store.hide_objects(true);
    let uploads = WorkQueue::new();
    let cleanup = WorkQueue::new();
    let slow_verify = UploadSettings {
        verify_attempts: 10,
        verify_delay: Duration::from_secs(60),
        ..settings()
    };
    let service = UploadService::new(store.clone(), uploads, cleanup, slow_verify);
    let record = record_on_disk(dir.path(), "1").await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = service.process(&record, &cancel).await.unwrap_err();
    assert!(matches!(err, UploadError::Cancelled(_)), "unexpected error {}", err);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!record.is_uploaded());
    assert!(record.file.temporary_path.exists());
}

#[tokio::test]
async fn test_record_outside_a_payload_is_refused() {
    let dir = TempDir::new().unwrap();
    let store = MockObjectStore::new();
    let (service, _, _) = service(store.clone());
    let record = FileRecord::hl7(dir.path(), "conn-1", "10.0.0.5").with_data(&b"MSH|^~\\&|"[..]);

    let err = service.process(&record, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, UploadError::Unassigned(id) if id == record.id));
    assert_eq!(store.put_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_already_uploaded_record_is_skipped() {
    let dir = TempDir::new().unwrap();
    let store = MockObjectStore::new();
    let (service, _, _) = service(store.clone());
    let record = record_on_disk(dir.path(), "1").await;
    service.process(&record, &CancellationToken::new()).await.unwrap();
    service.process(&record, &CancellationToken::new()).await.unwrap();
    assert_eq!(store.put_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_workers_upload_then_reclaim_local_space() {
    let dir = TempDir::new().unwrap();
    let temp_root = dir.path().join("tmp");
    let store_root = dir.path().join("storage");
    let store = Arc::new(FilesystemObjectStore::new(&store_root).unwrap());

    let uploads = WorkQueue::new();
    let cleanup = WorkQueue::new();
    let service = Arc::new(UploadService::new(store, uploads.clone(), cleanup.clone(), settings()));
    let reclaimer = Arc::new(SpaceReclaimer::new(&temp_root, cleanup));

    let cancel = CancellationToken::new();
    let workers = service.start(cancel.clone());
    let reclaim_worker = reclaimer.start(cancel.clone());

    let record = Arc::new(record_on_disk(&temp_root, "7").await);
    let payload_id = record.payload_id().unwrap();
    uploads.enqueue(record.clone()).unwrap();

    let local = record.file.temporary_path.clone();
    assert!(wait_for(Duration::from_secs(5), || !local.exists()).await);
    assert!(record.is_moved());
    assert!(!temp_root.join("assoc").exists());
    assert!(temp_root.exists());
    assert!(store_root
        .join(BUCKET)
        .join(payload_id.to_string())
        .join("dcm/1.2/1.2.3/7.dcm")
        .exists());

    cancel.cancel();
    for worker in workers {
        worker.await.unwrap();
    }
    reclaim_worker.await.unwrap();
}
