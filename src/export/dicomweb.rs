//! STOW-RS export to DICOMweb services.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;

use crate::config::{Config, DicomWebAuth, DicomWebDestination, DicomWebExportConfig};
use crate::export::{DeliveryError, ExportContext, ExportService, ExportTopics, ExportTransport};
use crate::models::ExportRequestDataMessage;

#[derive(Debug, Clone)]
pub struct DicomWebTransport {
    client: Client,
    destinations: HashMap<String, DicomWebDestination>,
}

impl DicomWebTransport {
    pub fn new(client: Client, destinations: HashMap<String, DicomWebDestination>) -> Self {
        Self { client, destinations }
    }

    pub fn from_config(config: &DicomWebExportConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self::new(client, config.destinations.clone()))
    }

    /// Wrap DICOM parts in a multipart/related body, returning the boundary and body
    fn build_multipart(parts: &[&[u8]]) -> (String, Vec<u8>) {
        let boundary = format!("dicomweb_{}", uuid::Uuid::new_v4());
        let mut buf: Vec<u8> = Vec::new();
        for part in parts {
            buf.extend_from_slice(format!("--{}\r\n", &boundary).as_bytes());
            buf.extend_from_slice(b"Content-Type: application/dicom\r\n\r\n");
            buf.extend_from_slice(part);
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(format!("--{}--\r\n", &boundary).as_bytes());
        (boundary, buf)
    }

    fn stow_url(destination: &DicomWebDestination) -> String {
        format!("{}/studies", destination.uri.trim_end_matches('/'))
    }
}

#[async_trait]
impl ExportTransport for DicomWebTransport {
    fn name(&self) -> &str {
        "dicomweb"
    }

    async fn deliver(
        &self,
        destination: &str,
        message: &ExportRequestDataMessage,
        data: &Bytes,
    ) -> Result<(), DeliveryError> {
        let target = self
            .destinations
            .get(destination)
            .ok_or_else(|| DeliveryError::unknown_destination(destination))?;

        if !dimse::is_dicom_part10(data) {
            return Err(DeliveryError::UnsupportedData(format!(
                "File '{}' is not a DICOM part 10 object",
                message.file_id
            )));
        }

        let (boundary, body) = Self::build_multipart(&[data.as_ref()]);
        let url = Self::stow_url(target);
        tracing::debug!(task_id = %message.export_task_id, "STOW-RS {} to {}", message.file_id, url);

        let mut request = self
            .client
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; type=\"application/dicom\"; boundary={}", boundary),
            )
            .header(reqwest::header::ACCEPT, "application/dicom+json")
            .body(body);
        request = match &target.auth {
            Some(DicomWebAuth::Basic { username, password }) => request.basic_auth(username, Some(password)),
            Some(DicomWebAuth::Bearer { token }) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(format!("STOW-RS request to {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Transport(format!(
                "STOW-RS to {} returned HTTP {}",
                url, status
            )))
        }
    }
}

/// The STOW-RS export pipeline listening on `{export_request_prefix}.{agent_name}`
pub fn dicomweb_export_service(
    config: &Config,
    ctx: ExportContext,
) -> Result<ExportService<DicomWebTransport>, reqwest::Error> {
    let dicomweb = &config.export.dicomweb;
    Ok(ExportService::new(
        dicomweb.agent_name.clone(),
        DicomWebTransport::from_config(dicomweb)?,
        ctx,
        ExportTopics {
            request: config.messaging.topics.export_request(&dicomweb.agent_name),
            complete: config.messaging.topics.export_complete.clone(),
        },
        dicomweb.max_connections,
    ))
}
