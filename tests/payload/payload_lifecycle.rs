#[path = "../common/mod.rs"]
mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::{dicom_record, test_config, wait_for, MockObjectStore, SwitchGate};
use imaging_gateway::broker::InMemoryBroker;
use imaging_gateway::export::PluginRegistry;
use imaging_gateway::models::{FileRecord, Payload, PayloadState, WorkflowRequestEvent};
use imaging_gateway::queue::WorkQueue;
use imaging_gateway::services::{AccumulatorError, AssemblerSettings, PayloadAssembler};
use imaging_gateway::{Gateway, GatewayContext};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

struct Harness {
    assembler: Arc<PayloadAssembler>,
    uploads: WorkQueue<Arc<FileRecord>>,
    notifications: WorkQueue<Payload>,
    cancel: CancellationToken,
    dir: TempDir,
}

fn harness(timeout: Duration) -> Harness {
    let dir = TempDir::new().unwrap();
    let uploads = WorkQueue::new();
    let notifications = WorkQueue::new();
    let cancel = CancellationToken::new();
    let (assembler, _coordinator) = PayloadAssembler::start(
        AssemblerSettings {
            payload_timeout: timeout,
            check_interval: Duration::from_secs(1),
        },
        Arc::new(SwitchGate::default()),
        uploads.clone(),
        notifications.clone(),
        cancel.clone(),
    );
    Harness {
        assembler,
        uploads,
        notifications,
        cancel,
        dir,
    }
}

fn drain(queue: &WorkQueue<Arc<FileRecord>>) -> Vec<Arc<FileRecord>> {
    std::iter::from_fn(|| queue.try_dequeue()).collect()
}

fn mark_uploaded(record: &FileRecord) {
    record.file.mark_uploaded();
    if let Some(sidecar) = &record.sidecar {
        sidecar.mark_uploaded();
    }
}

#[tokio::test(start_paused = true)]
async fn test_payload_closes_once_after_inactivity_with_all_files() {
    let h = harness(Duration::from_secs(5));

    let mut payload_ids = HashSet::new();
    for i in 0..3 {
        if i > 0 {
            sleep(Duration::from_secs(1)).await;
        }
        let record = dicom_record(h.dir.path(), "assoc-1", &format!("1.2.3.4.{}", i));
        payload_ids.insert(h.assembler.add("assoc-1", record).unwrap());
    }
    assert_eq!(payload_ids.len(), 1);

    // Last file arrived at t=2s, so the payload is still open at t=6s
    sleep(Duration::from_secs(4)).await;
    assert!(h.uploads.is_empty());
    assert_eq!(h.assembler.active_payloads(), 1);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.uploads.len(), 3);
    assert_eq!(h.assembler.active_payloads(), 0);

    sleep(Duration::from_secs(10)).await;
    let files = drain(&h.uploads);
    assert_eq!(files.len(), 3);
    let payload_id = payload_ids.into_iter().next().unwrap();
    assert!(files.iter().all(|f| f.payload_id() == Some(payload_id)));

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_adding_the_same_file_twice_keeps_one_member() {
    let h = harness(Duration::from_secs(5));

    let first = dicom_record(h.dir.path(), "assoc-2", "1.2.3.9");
    let mut again = dicom_record(h.dir.path(), "assoc-2", "1.2.3.9");
    again.id = first.id;

    let a = h.assembler.add("assoc-2", first).unwrap();
    let b = h.assembler.add("assoc-2", again).unwrap();
    assert_eq!(a, b);

    sleep(Duration::from_secs(7)).await;
    assert_eq!(drain(&h.uploads).len(), 1);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_keys_accumulate_independently_and_late_files_open_a_new_payload() {
    let h = harness(Duration::from_secs(5));

    let a = h.assembler.add("assoc-a", dicom_record(h.dir.path(), "assoc-a", "1")).unwrap();
    let b = h
        .assembler
        .add_with_timeout("assoc-b", dicom_record(h.dir.path(), "assoc-b", "2"), Duration::from_secs(20))
        .unwrap();
    assert_ne!(a, b);

    sleep(Duration::from_secs(6)).await;
    assert_eq!(h.uploads.len(), 1);
    assert_eq!(h.assembler.active_payloads(), 1);

    let late = h.assembler.add("assoc-a", dicom_record(h.dir.path(), "assoc-a", "3")).unwrap();
    assert_ne!(late, a);
    assert_eq!(h.assembler.active_payloads(), 2);

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_payload_is_notified_only_after_every_file_is_uploaded() {
    let h = harness(Duration::from_secs(1));

    for sop in ["1", "2"] {
        h.assembler.add("assoc-3", dicom_record(h.dir.path(), "assoc-3", sop)).unwrap();
    }
    sleep(Duration::from_secs(2)).await;
    let files = drain(&h.uploads);
    assert_eq!(files.len(), 2);

    mark_uploaded(&files[0]);
    sleep(Duration::from_secs(5)).await;
    assert!(h.notifications.is_empty());

    mark_uploaded(&files[1]);
    sleep(Duration::from_secs(2)).await;
    let payload = h.notifications.try_dequeue().expect("payload ready for notification");
    assert_eq!(payload.state(), PayloadState::Notify);
    assert_eq!(payload.count(), 2);
    assert!(payload.files().iter().all(|f| f.is_uploaded()));

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_payload_with_failed_upload_is_never_notified() {
    let h = harness(Duration::from_secs(1));

    for sop in ["1", "2"] {
        h.assembler.add("assoc-4", dicom_record(h.dir.path(), "assoc-4", sop)).unwrap();
    }
    sleep(Duration::from_secs(2)).await;
    let files = drain(&h.uploads);

    mark_uploaded(&files[0]);
    files[1].file.mark_upload_failed();
    sleep(Duration::from_secs(5)).await;
    assert!(h.notifications.is_empty());
    assert!(!files[1].is_moved());

    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_add_after_shutdown_is_refused() {
    let h = harness(Duration::from_secs(1));
    h.cancel.cancel();
    sleep(Duration::from_millis(100)).await;

    let result = h.assembler.add("assoc-5", dicom_record(h.dir.path(), "assoc-5", "1"));
    assert!(matches!(result, Err(AccumulatorError::ShutDown)));
}

#[tokio::test]
async fn test_gateway_uploads_payload_and_requests_workflow() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let temp_root = config.storage.temporary_data_dir.clone();
    let topic = config.messaging.topics.workflow_request.clone();
    let bucket = config.storage.bucket.clone();

    let store = MockObjectStore::new();
    let broker = InMemoryBroker::new();
    let context = GatewayContext {
        store: store.clone(),
        broker: Arc::new(broker.clone()),
        admission: Arc::new(SwitchGate::default()),
        plugins: PluginRegistry::new(),
    };
    let gateway = Gateway::start(config, context).await.unwrap();
    let services: Vec<&str> = gateway.export_services().collect();
    assert_eq!(services, vec!["scu", "dicomweb", "hl7"]);

    assert!(gateway.assembler().has_space_for_store());
    let payload_id = gateway
        .assembler()
        .add("assoc-9", dicom_record(&temp_root, "assoc-9", "1.2.840.1"))
        .unwrap();
    gateway
        .assembler()
        .add("assoc-9", dicom_record(&temp_root, "assoc-9", "1.2.840.2"))
        .unwrap();

    assert!(wait_for(Duration::from_secs(10), || !broker.published(&topic).is_empty()).await);
    let published = broker.published(&topic);
    assert_eq!(published.len(), 1);

    let event: WorkflowRequestEvent = published[0].decode().unwrap();
    assert_eq!(event.payload_id, payload_id);
    assert_eq!(event.bucket, bucket);
    assert_eq!(event.file_count, 2);
    assert_eq!(event.workflows, vec!["ai-triage".to_string()]);
    assert_eq!(event.calling_ae_title.as_deref(), Some("MODALITY"));
    assert_eq!(event.called_ae_title.as_deref(), Some("GATEWAY"));
    assert_eq!(published[0].correlation_id, "assoc-9");

    let keys = store.keys(&bucket);
    assert_eq!(keys.len(), 4);
    assert!(keys.iter().all(|k| k.starts_with(&payload_id.to_string())));
    assert!(keys.contains(&format!("{}/dcm/1.2.3/1.2.3.4/1.2.840.1.dcm", payload_id)));
    assert!(keys.contains(&format!("{}/dcm/1.2.3/1.2.3.4/1.2.840.1.dcm.json", payload_id)));
    let object = store
        .object(&bucket, &format!("{}/dcm/1.2.3/1.2.3.4/1.2.840.2.dcm", payload_id))
        .unwrap();
    assert_eq!(object.metadata.get("source").map(String::as_str), Some("MODALITY"));
    assert_eq!(object.metadata.get("workflows").map(String::as_str), Some("ai-triage"));

    assert!(gateway.shutdown().await.is_empty());
}
