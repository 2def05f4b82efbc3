//! Files received by the protocol front ends and their storage lifecycle.
//!
//! A [`FileRecord`] owns one primary [`StorageObject`] and, for DICOM
//! instances, a JSON sidecar. Status flags are atomics so the upload worker,
//! the cleanup worker and the payload coordinator can observe them without
//! sharing a lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, OnceLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CONTENT_TYPE_DICOM: &str = "application/dicom";
pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_XML: &str = "application/xml";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";

const DICOM_DIR: &str = "dcm";
const EHR_DIR: &str = "ehr";

/// Kind-specific attributes of a received file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileKind {
    Dicom {
        study_instance_uid: String,
        series_instance_uid: String,
        sop_instance_uid: String,
        calling_ae_title: String,
        called_ae_title: String,
    },
    Hl7,
    Fhir {
        resource_type: String,
        resource_id: String,
    },
    Generic,
}

/// Serialization format of a FHIR resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FhirFormat {
    Json,
    Xml,
}

impl FhirFormat {
    fn extension(self) -> &'static str {
        match self {
            FhirFormat::Json => ".json",
            FhirFormat::Xml => ".xml",
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            FhirFormat::Json => CONTENT_TYPE_JSON,
            FhirFormat::Xml => CONTENT_TYPE_XML,
        }
    }
}

/// DICOM identity of an instance received over an association
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DicomIdentity {
    pub association_id: String,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
}

/// One object that has to reach durable storage
#[derive(Debug)]
pub struct StorageObject {
    /// Local path the front end wrote the file to
    pub temporary_path: PathBuf,
    /// Path relative to the payload directory in the bucket
    pub upload_path: String,
    pub content_type: String,
    data: Mutex<Option<Bytes>>,
    uploaded: AtomicBool,
    moved: AtomicBool,
    upload_failed: AtomicBool,
    retry_count: AtomicU32,
    date_uploaded: Mutex<Option<DateTime<Utc>>>,
}

impl StorageObject {
    pub fn new(
        temporary_path: impl Into<PathBuf>,
        upload_path: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            temporary_path: temporary_path.into(),
            upload_path: upload_path.into(),
            content_type: content_type.into(),
            data: Mutex::new(None),
            uploaded: AtomicBool::new(false),
            moved: AtomicBool::new(false),
            upload_failed: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            date_uploaded: Mutex::new(None),
        }
    }

    /// Keep the content in memory so the upload does not touch the disk
    pub fn set_data(&self, data: Bytes) {
        *lock(&self.data) = Some(data);
    }

    pub fn data(&self) -> Option<Bytes> {
        lock(&self.data).clone()
    }

    pub fn has_data(&self) -> bool {
        lock(&self.data).is_some()
    }

    /// In-memory content if present, otherwise the temporary file
    pub async fn read_bytes(&self) -> std::io::Result<Bytes> {
        if let Some(data) = self.data() {
            return Ok(data);
        }
        tokio::fs::read(&self.temporary_path).await.map(Bytes::from)
    }

    /// Record a confirmed write to durable storage and drop the buffer.
    pub fn mark_uploaded(&self) {
        *lock(&self.date_uploaded) = Some(Utc::now());
        self.upload_failed.store(false, Ordering::SeqCst);
        self.uploaded.store(true, Ordering::SeqCst);
        *lock(&self.data) = None;
    }

    /// Record that the object was found at its final path.
    ///
    /// Returns false, leaving the flag unset, if the object was never uploaded.
    pub fn mark_moved(&self) -> bool {
        if !self.is_uploaded() {
            return false;
        }
        self.moved.store(true, Ordering::SeqCst);
        true
    }

    pub fn mark_upload_failed(&self) {
        self.upload_failed.store(true, Ordering::SeqCst);
    }

    pub fn increment_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn is_uploaded(&self) -> bool {
        self.uploaded.load(Ordering::SeqCst)
    }

    pub fn is_moved(&self) -> bool {
        self.moved.load(Ordering::SeqCst)
    }

    pub fn is_upload_failed(&self) -> bool {
        self.upload_failed.load(Ordering::SeqCst)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    pub fn date_uploaded(&self) -> Option<DateTime<Utc>> {
        *lock(&self.date_uploaded)
    }
}

/// A file received from a producer, shared between the payload and workers
#[derive(Debug)]
pub struct FileRecord {
    pub id: Uuid,
    pub correlation_id: String,
    /// Calling AE title or remote endpoint the file came from
    pub source: String,
    pub workflows: Vec<String>,
    pub date_received: DateTime<Utc>,
    pub kind: FileKind,
    pub file: StorageObject,
    pub sidecar: Option<StorageObject>,
    payload_id: OnceLock<Uuid>,
}

impl FileRecord {
    /// A file without protocol specific layout
    pub fn generic(
        temporary_path: impl Into<PathBuf>,
        upload_path: impl Into<String>,
        content_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self::with_objects(
            FileKind::Generic,
            source.into(),
            StorageObject::new(temporary_path, upload_path, content_type),
            None,
        )
    }

    /// A DICOM instance received over an association, with its JSON sidecar.
    ///
    /// Stored locally as `{association}/dcm/{uuid}.dcm` and uploaded as
    /// `dcm/{study}/{series}/{sop}.dcm`.
    pub fn dicom(temp_root: &Path, identity: DicomIdentity) -> Self {
        let id = Uuid::new_v4();
        let temporary_path = temp_root
            .join(&identity.association_id)
            .join(DICOM_DIR)
            .join(format!("{}.dcm", id));
        let upload_path = format!(
            "{}/{}/{}/{}.dcm",
            DICOM_DIR,
            identity.study_instance_uid,
            identity.series_instance_uid,
            identity.sop_instance_uid
        );
        let sidecar = StorageObject::new(
            sidecar_path(&temporary_path),
            format!("{}.json", upload_path),
            CONTENT_TYPE_JSON,
        );
        let file = StorageObject::new(temporary_path, upload_path, CONTENT_TYPE_DICOM);

        let mut record = Self::with_objects(
            FileKind::Dicom {
                study_instance_uid: identity.study_instance_uid,
                series_instance_uid: identity.series_instance_uid,
                sop_instance_uid: identity.sop_instance_uid,
                calling_ae_title: identity.calling_ae_title.clone(),
                called_ae_title: identity.called_ae_title,
            },
            identity.calling_ae_title,
            file,
            Some(sidecar),
        );
        record.id = id;
        record
    }

    /// An HL7 v2 message received on an MLLP connection
    pub fn hl7(temp_root: &Path, connection_id: &str, source: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let temporary_path = temp_root
            .join(connection_id)
            .join(EHR_DIR)
            .join(format!("{}.txt", id));
        let upload_path = format!("{}/{}.txt", EHR_DIR, id);

        let mut record = Self::with_objects(
            FileKind::Hl7,
            source.into(),
            StorageObject::new(temporary_path, upload_path, CONTENT_TYPE_TEXT),
            None,
        );
        record.id = id;
        record
    }

    /// A FHIR resource posted in a transaction
    pub fn fhir(
        temp_root: &Path,
        transaction_id: &str,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        format: FhirFormat,
        source: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let resource_type = resource_type.into();
        let resource_id = resource_id.into();
        let temporary_path = temp_root
            .join(transaction_id)
            .join(EHR_DIR)
            .join(format!("{}{}", id, format.extension()));
        let upload_path = format!(
            "{}/{}/{}{}",
            EHR_DIR,
            resource_type,
            resource_id,
            format.extension()
        );

        let mut record = Self::with_objects(
            FileKind::Fhir {
                resource_type,
                resource_id,
            },
            source.into(),
            StorageObject::new(temporary_path, upload_path, format.content_type()),
            None,
        );
        record.id = id;
        record
    }

    fn with_objects(
        kind: FileKind,
        source: String,
        file: StorageObject,
        sidecar: Option<StorageObject>,
    ) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            correlation_id: id.to_string(),
            source,
            workflows: Vec::new(),
            date_received: Utc::now(),
            kind,
            file,
            sidecar,
            payload_id: OnceLock::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_workflows<I, S>(mut self, workflows: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.workflows = workflows.into_iter().map(Into::into).collect();
        self
    }

    /// Buffer the primary content in memory
    pub fn with_data(self, data: impl Into<Bytes>) -> Self {
        self.file.set_data(data.into());
        self
    }

    /// Buffer the sidecar content in memory; ignored for kinds without one
    pub fn with_sidecar_data(self, data: impl Into<Bytes>) -> Self {
        if let Some(sidecar) = &self.sidecar {
            sidecar.set_data(data.into());
        }
        self
    }

    /// Bind the record to the payload it was grouped into. First call wins.
    pub fn assign_payload(&self, payload_id: Uuid) -> bool {
        self.payload_id.set(payload_id).is_ok()
    }

    pub fn payload_id(&self) -> Option<Uuid> {
        self.payload_id.get().copied()
    }

    /// Key of `object` in the bucket, once the record belongs to a payload
    pub fn upload_key(&self, object: &StorageObject) -> Option<String> {
        self.payload_id()
            .map(|payload_id| format!("{}/{}", payload_id, object.upload_path))
    }

    /// Objects in upload order: sidecar first, then the primary file
    pub fn upload_order(&self) -> Vec<&StorageObject> {
        let mut objects = Vec::with_capacity(2);
        if let Some(sidecar) = &self.sidecar {
            objects.push(sidecar);
        }
        objects.push(&self.file);
        objects
    }

    pub fn local_paths(&self) -> Vec<&Path> {
        self.upload_order()
            .into_iter()
            .map(|object| object.temporary_path.as_path())
            .collect()
    }

    /// True only when every object of the record reached durable storage
    pub fn is_uploaded(&self) -> bool {
        self.upload_order().iter().all(|object| object.is_uploaded())
    }

    pub fn is_moved(&self) -> bool {
        self.upload_order().iter().all(|object| object.is_moved())
    }

    pub fn is_upload_failed(&self) -> bool {
        self.upload_order()
            .iter()
            .any(|object| object.is_upload_failed())
    }

    /// Uploaded, or given up on
    pub fn is_terminal(&self) -> bool {
        self.is_uploaded() || self.is_upload_failed()
    }

    pub fn calling_ae_title(&self) -> Option<&str> {
        match &self.kind {
            FileKind::Dicom {
                calling_ae_title, ..
            } => Some(calling_ae_title),
            _ => None,
        }
    }

    pub fn called_ae_title(&self) -> Option<&str> {
        match &self.kind {
            FileKind::Dicom {
                called_ae_title, ..
            } => Some(called_ae_title),
            _ => None,
        }
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".json");
    PathBuf::from(sidecar)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
