//! Export pipelines pushing stored files to external destinations.
//!
//! Every protocol runs the same [`ExportService`] over its own
//! [`ExportTransport`]; only delivery and topics differ.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::broker::BrokerError;
use crate::models::{ExportRequestDataMessage, FileExportStatus};

pub mod dicom;
pub mod dicomweb;
pub mod external_app;
pub mod hl7;
pub mod pipeline;
pub mod plugins;

pub use dicom::{scu_export_service, ScuTransport};
pub use dicomweb::{dicomweb_export_service, DicomWebTransport};
pub use external_app::external_app_export_service;
pub use hl7::{hl7_export_service, Hl7Transport};
pub use pipeline::{ExportContext, ExportHandle, ExportService, ExportTopics};
pub use plugins::{OutputDataPlugin, PluginError, PluginRegistry};

pub const NO_DESTINATION: &str = "Export task does not have destination set.";
pub const DOWNLOAD_FAILED: &str = "Error downloading payload.";

/// Failure delivering one file to one destination
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Will fail the same way on every attempt
    #[error("{0}")]
    Configuration(String),
    #[error("{0}")]
    UnsupportedData(String),
    /// Network or remote service failure, worth retrying
    #[error("{0}")]
    Transport(String),
    /// Abandoned on shutdown
    #[error(transparent)]
    Cancelled(#[from] crate::retry::Cancelled),
}

impl DeliveryError {
    pub fn unknown_destination(name: &str) -> Self {
        Self::Configuration(format!("Specified destination '{}' does not exist.", name))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transport(_))
    }

    pub fn file_status(&self) -> FileExportStatus {
        match self {
            DeliveryError::Configuration(_) => FileExportStatus::ConfigurationError,
            DeliveryError::UnsupportedData(_) => FileExportStatus::UnsupportedDataType,
            DeliveryError::Transport(_) | DeliveryError::Cancelled(_) => FileExportStatus::ServiceError,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("export service '{0}' is already running")]
    AlreadyRunning(String),
    #[error("export service '{0}' did not drain within the shutdown timeout")]
    ShutdownTimeout(String),
}

/// Protocol-specific delivery of one file to one named destination
#[async_trait]
pub trait ExportTransport: Send + Sync + 'static {
    /// Short protocol name used in logs
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        destination: &str,
        message: &ExportRequestDataMessage,
        data: &Bytes,
    ) -> Result<(), DeliveryError>;
}

#[async_trait]
impl<T: ExportTransport> ExportTransport for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn deliver(
        &self,
        destination: &str,
        message: &ExportRequestDataMessage,
        data: &Bytes,
    ) -> Result<(), DeliveryError> {
        (**self).deliver(destination, message, data).await
    }
}
