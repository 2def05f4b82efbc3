//! HL7 v2 export over MLLP.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{Config, Hl7Destination, Hl7ExportConfig};
use crate::export::{DeliveryError, ExportContext, ExportService, ExportTopics, ExportTransport};
use crate::models::ExportRequestDataMessage;

pub const HL7_SERVICE: &str = "hl7";

const START_BLOCK: u8 = 0x0B;
const END_BLOCK: u8 = 0x1C;
const CARRIAGE_RETURN: u8 = 0x0D;
const MAX_ACK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Hl7Transport {
    destinations: HashMap<String, Hl7Destination>,
    timeout: Duration,
}

impl Hl7Transport {
    pub fn new(destinations: HashMap<String, Hl7Destination>, timeout: Duration) -> Self {
        Self { destinations, timeout }
    }

    pub fn from_config(config: &Hl7ExportConfig) -> Self {
        Self::new(config.destinations.clone(), config.timeout())
    }

    async fn exchange(&self, destination: &Hl7Destination, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        let mut stream = TcpStream::connect((destination.host.as_str(), destination.port)).await?;
        stream.write_all(&frame(data)).await?;
        stream.flush().await?;
        read_frame(&mut stream).await
    }
}

/// Wrap a message in an MLLP block
pub fn frame(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(message.len() + 3);
    framed.push(START_BLOCK);
    framed.extend_from_slice(message);
    framed.push(END_BLOCK);
    framed.push(CARRIAGE_RETURN);
    framed
}

/// Read one MLLP block and return its content
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(2).position(|w| w == [END_BLOCK, CARRIAGE_RETURN]) {
            let start = buf.iter().position(|b| *b == START_BLOCK).map_or(0, |p| p + 1);
            if start > end {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed MLLP frame"));
            }
            return Ok(buf[start..end].to_vec());
        }
        if buf.len() > MAX_ACK_BYTES {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "MLLP response too large"));
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before end of MLLP frame",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Acknowledgment code from the MSA segment, if any
pub fn ack_code(ack: &str) -> Option<&str> {
    ack.split(['\r', '\n'])
        .find(|segment| segment.starts_with("MSA|"))
        .and_then(|segment| segment.split('|').nth(1))
}

#[async_trait]
impl ExportTransport for Hl7Transport {
    fn name(&self) -> &str {
        HL7_SERVICE
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

        if !data.starts_with(b"MSH") {
            return Err(DeliveryError::UnsupportedData(format!(
                "File '{}' is not an HL7 v2 message",
                message.file_id
            )));
        }

        let address = format!("{}:{}", target.host, target.port);
        let response = tokio::time::timeout(self.timeout, self.exchange(target, data))
            .await
            .map_err(|_| DeliveryError::Transport(format!("MLLP exchange with {} timed out", address)))?
            .map_err(|e| DeliveryError::Transport(format!("MLLP exchange with {} failed: {}", address, e)))?;

        let ack = String::from_utf8_lossy(&response);
        match ack_code(&ack) {
            Some("AA") | Some("CA") => {
                tracing::debug!(task_id = %message.export_task_id, "HL7 message accepted by {}", address);
                Ok(())
            }
            Some(code) => Err(DeliveryError::Transport(format!(
                "{} answered with acknowledgment code {}",
                address, code
            ))),
            None => Err(DeliveryError::Transport(format!(
                "{} answered without an MSA segment",
                address
            ))),
        }
    }
}

pub fn hl7_export_service(config: &Config, ctx: ExportContext) -> ExportService<Hl7Transport> {
    let topics = &config.messaging.topics;
    ExportService::new(
        HL7_SERVICE,
        Hl7Transport::from_config(&config.export.hl7),
        ctx,
        ExportTopics {
            request: topics.export_hl7.clone(),
            complete: topics.export_hl7_complete.clone(),
        },
        config.export.hl7.max_connections,
    )
}
