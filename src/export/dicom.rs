//! C-STORE export to configured DICOM application entities.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use dimse::{DatasetStream, DimseError, DimseScu, RemoteNode, ScuConfig};

use crate::config::{Config, DicomExportConfig};
use crate::export::{DeliveryError, ExportContext, ExportService, ExportTopics, ExportTransport};
use crate::models::ExportRequestDataMessage;

/// Pushes part-10 objects to named DICOM destinations via C-STORE
#[derive(Debug, Clone)]
pub struct ScuTransport {
    scu: DimseScu,
    destinations: HashMap<String, RemoteNode>,
}

impl ScuTransport {
    pub fn new(scu: DimseScu, destinations: HashMap<String, RemoteNode>) -> Self {
        Self { scu, destinations }
    }

    pub fn from_config(config: &DicomExportConfig, temp_dir: &std::path::Path) -> Self {
        let scu = DimseScu::new(ScuConfig::new(config.ae_title.clone())).with_temp_dir(temp_dir);
        Self::new(scu, config.destinations.clone())
    }
}

#[async_trait]
impl ExportTransport for ScuTransport {
    fn name(&self) -> &str {
        "dicom"
    }

    async fn deliver(
        &self,
        destination: &str,
        message: &ExportRequestDataMessage,
        data: &Bytes,
    ) -> Result<(), DeliveryError> {
        let node = self
            .destinations
            .get(destination)
            .ok_or_else(|| DeliveryError::unknown_destination(destination))?;

        tracing::debug!(
            task_id = %message.export_task_id,
            "C-STORE {} to {}",
            message.file_id,
            node
        );
        let mut dataset = DatasetStream::from_bytes(data.clone());
        if let Some(uid) = sop_instance_uid(&message.file_id) {
            dataset = dataset.with_sop_instance_uid(uid);
        }
        self.scu.store(node, dataset).await.map_err(map_dimse_error)
    }
}

/// DICOM objects are stored as `.../{series}/{sop_instance_uid}.dcm`
fn sop_instance_uid(file_id: &str) -> Option<&str> {
    let path = std::path::Path::new(file_id);
    if path.extension()? != "dcm" {
        return None;
    }
    path.file_stem()?.to_str()
}

fn map_dimse_error(error: DimseError) -> DeliveryError {
    match error {
        DimseError::InvalidDataset(_) => DeliveryError::UnsupportedData(error.to_string()),
        e if e.is_recoverable() => DeliveryError::Transport(e.to_string()),
        e => DeliveryError::Configuration(e.to_string()),
    }
}

/// The C-STORE export pipeline listening on `{export_request_prefix}.{agent_name}`
pub fn scu_export_service(config: &Config, ctx: ExportContext) -> ExportService<ScuTransport> {
    let dicom = &config.export.dicom;
    ExportService::new(
        dicom.agent_name.clone(),
        ScuTransport::from_config(dicom, &config.storage.temporary_data_dir),
        ctx,
        ExportTopics {
            request: config.messaging.topics.export_request(&dicom.agent_name),
            complete: config.messaging.topics.export_complete.clone(),
        },
        dicom.max_associations,
    )
}
