//! A group of related files that is uploaded and announced as one unit.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use super::file_record::FileRecord;

/// Notification attempts allowed before a payload is abandoned
pub const MAX_RETRY: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadState {
    /// Open, still accepting files
    Created,
    /// Closed, files handed to the upload workers
    Upload,
    /// Fully uploaded, waiting for the workflow request to be published
    Notify,
}

#[derive(Debug)]
pub struct Payload {
    pub id: Uuid,
    /// Correlation key the payload was grouped by
    pub key: String,
    pub correlation_id: String,
    pub date_created: DateTime<Utc>,
    pub timeout: Duration,
    files: Vec<Arc<FileRecord>>,
    last_activity: Instant,
    retry_count: u32,
    state: PayloadState,
}

impl Payload {
    pub fn new(key: impl Into<String>, correlation_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            correlation_id: correlation_id.into(),
            date_created: Utc::now(),
            timeout,
            files: Vec::new(),
            last_activity: Instant::now(),
            retry_count: 0,
            state: PayloadState::Created,
        }
    }

    /// Append `file` and restart the inactivity timer.
    ///
    /// Returns false when a file with the same id is already a member; the
    /// timer is still reset since the producer is evidently active.
    pub fn add(&mut self, file: Arc<FileRecord>) -> bool {
        self.last_activity = Instant::now();
        if self.contains(file.id) {
            return false;
        }
        file.assign_payload(self.id);
        self.files.push(file);
        true
    }

    pub fn contains(&self, file_id: Uuid) -> bool {
        self.files.iter().any(|f| f.id == file_id)
    }

    pub fn files(&self) -> &[Arc<FileRecord>] {
        &self.files
    }

    pub fn count(&self) -> usize {
        self.files.len()
    }

    pub fn state(&self) -> PayloadState {
        self.state
    }

    pub fn set_state(&mut self, state: PayloadState) {
        self.state = state;
    }

    pub fn elapsed(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Instant at which the payload times out unless another file arrives
    pub fn deadline(&self) -> Instant {
        self.last_activity + self.timeout
    }

    pub fn has_timed_out(&self) -> bool {
        self.elapsed() >= self.timeout
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Consume one retry; false once the cap is reached
    pub fn can_retry(&mut self) -> bool {
        self.retry_count += 1;
        self.retry_count < MAX_RETRY
    }

    pub fn is_upload_complete(&self) -> bool {
        !self.files.is_empty() && self.files.iter().all(|f| f.is_uploaded())
    }

    /// Every file is settled and at least one will never be uploaded
    pub fn has_failed_uploads(&self) -> bool {
        self.files.iter().all(|f| f.is_terminal()) && self.files.iter().any(|f| !f.is_uploaded())
    }

    /// Union of member workflows, in first-seen order
    pub fn workflows(&self) -> Vec<String> {
        let mut workflows: Vec<String> = Vec::new();
        for workflow in self.files.iter().flat_map(|f| f.workflows.iter()) {
            if !workflows.contains(workflow) {
                workflows.push(workflow.clone());
            }
        }
        workflows
    }

    pub fn calling_ae_title(&self) -> Option<String> {
        self.files
            .iter()
            .find_map(|f| f.calling_ae_title().map(str::to_string))
    }

    pub fn called_ae_title(&self) -> Option<String> {
        self.files
            .iter()
            .find_map(|f| f.called_ae_title().map(str::to_string))
    }
}
