//! JSON event bodies exchanged with the broker.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::export::{ExportStatus, FileExportStatus};
use super::payload::Payload;

/// Published once a payload is fully uploaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRequestEvent {
    pub payload_id: Uuid,
    pub bucket: String,
    pub workflows: Vec<String>,
    pub file_count: usize,
    pub correlation_id: String,
    pub timestamp: DateTime<Utc>,
    pub calling_ae_title: Option<String>,
    pub called_ae_title: Option<String>,
    pub files: Vec<UploadedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: Uuid,
    pub path: String,
    pub content_type: String,
    pub metadata_path: Option<String>,
}

impl WorkflowRequestEvent {
    pub fn from_payload(payload: &Payload, bucket: &str) -> Self {
        let files = payload
            .files()
            .iter()
            .map(|file| UploadedFile {
                id: file.id,
                path: file
                    .upload_key(&file.file)
                    .unwrap_or_else(|| file.file.upload_path.clone()),
                content_type: file.file.content_type.clone(),
                metadata_path: file.sidecar.as_ref().and_then(|s| file.upload_key(s)),
            })
            .collect();

        Self {
            payload_id: payload.id,
            bucket: bucket.to_string(),
            workflows: payload.workflows(),
            file_count: payload.count(),
            correlation_id: payload.correlation_id.clone(),
            timestamp: payload.date_created,
            calling_ae_title: payload.calling_ae_title(),
            called_ae_title: payload.called_ae_title(),
            files,
        }
    }
}

/// Inbound request to push stored files to one or more destinations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequestEvent {
    pub export_task_id: String,
    pub workflow_instance_id: String,
    pub correlation_id: String,
    /// Object keys in the storage bucket
    pub files: Vec<String>,
    pub destinations: Vec<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
}

/// Outcome of an export task, published exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportCompleteEvent {
    pub export_task_id: String,
    pub workflow_instance_id: String,
    pub correlation_id: String,
    pub status: ExportStatus,
    pub file_statuses: HashMap<String, FileExportStatus>,
    pub messages: Vec<String>,
}
