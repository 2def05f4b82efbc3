//! Export task bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::events::{ExportCompleteEvent, ExportRequestEvent};
use super::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportStatus {
    Success,
    Failure,
    PartialFailure,
    Unknown,
}

impl ExportStatus {
    pub fn from_counts(succeeded: usize, failed: usize, total: usize) -> Self {
        if total > 0 && succeeded == total {
            ExportStatus::Success
        } else if total > 0 && failed == total {
            ExportStatus::Failure
        } else if succeeded > 0 && failed > 0 {
            ExportStatus::PartialFailure
        } else {
            ExportStatus::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileExportStatus {
    Success,
    ConfigurationError,
    ServiceError,
    DownloadError,
    UnsupportedDataType,
}

/// One file of an export task travelling through the pipeline stages
#[derive(Debug, Clone)]
pub struct ExportRequestDataMessage {
    pub export_task_id: String,
    pub correlation_id: String,
    /// Object key in the storage bucket
    pub file_id: String,
    pub destinations: Vec<String>,
    pub plugins: Vec<String>,
    pub data: Option<Bytes>,
    status: FileExportStatus,
    failed: bool,
    messages: Vec<String>,
}

impl ExportRequestDataMessage {
    pub fn new(request: &ExportRequestEvent, file_id: impl Into<String>) -> Self {
        Self {
            export_task_id: request.export_task_id.clone(),
            correlation_id: request.correlation_id.clone(),
            file_id: file_id.into(),
            destinations: request.destinations.clone(),
            plugins: request.plugins.clone(),
            data: None,
            status: FileExportStatus::Success,
            failed: false,
            messages: Vec::new(),
        }
    }

    /// Mark the file failed. The first failure decides the reported status.
    pub fn set_failed(&mut self, status: FileExportStatus, message: impl Into<String>) {
        if !self.failed {
            self.status = status;
        }
        self.failed = true;
        self.messages.push(message.into());
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn status(&self) -> FileExportStatus {
        self.status
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

#[derive(Debug, Default)]
struct TaskProgress {
    succeeded: usize,
    failed: usize,
    messages: Vec<String>,
    file_statuses: HashMap<String, FileExportStatus>,
    completed: bool,
}

/// Live state of one export task
#[derive(Debug)]
pub struct ExportTaskState {
    pub request: ExportRequestEvent,
    /// Inbound broker message, acknowledged when the task completes
    pub message: Message,
    progress: Mutex<TaskProgress>,
}

impl ExportTaskState {
    pub fn new(request: ExportRequestEvent, message: Message) -> Self {
        Self {
            request,
            message,
            progress: Mutex::new(TaskProgress::default()),
        }
    }

    pub fn total_files(&self) -> usize {
        self.request.files.len()
    }

    /// Count one file outcome.
    ///
    /// Returns the completion event for the call that brings
    /// `succeeded + failed` to the task's file count, and `None` otherwise.
    pub fn record(&self, file: &ExportRequestDataMessage) -> Option<ExportCompleteEvent> {
        let mut progress = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if progress.completed {
            return None;
        }

        if file.is_failed() {
            progress.failed += 1;
            progress.messages.extend(file.messages().iter().cloned());
        } else {
            progress.succeeded += 1;
        }
        progress
            .file_statuses
            .insert(file.file_id.clone(), file.status());

        if progress.succeeded + progress.failed < self.total_files() {
            return None;
        }
        progress.completed = true;

        Some(ExportCompleteEvent {
            export_task_id: self.request.export_task_id.clone(),
            workflow_instance_id: self.request.workflow_instance_id.clone(),
            correlation_id: self.request.correlation_id.clone(),
            status: ExportStatus::from_counts(progress.succeeded, progress.failed, self.total_files()),
            file_statuses: progress.file_statuses.clone(),
            messages: progress.messages.clone(),
        })
    }

    /// Completion event for a task with no files
    pub fn empty_completion(&self) -> ExportCompleteEvent {
        ExportCompleteEvent {
            export_task_id: self.request.export_task_id.clone(),
            workflow_instance_id: self.request.workflow_instance_id.clone(),
            correlation_id: self.request.correlation_id.clone(),
            status: ExportStatus::Unknown,
            file_statuses: HashMap::new(),
            messages: Vec::new(),
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        let progress = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (progress.succeeded, progress.failed)
    }
}
