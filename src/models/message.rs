use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

pub const APPLICATION_ID: &str = "imaging-gateway";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A broker message with a JSON body
#[derive(Debug, Clone)]
pub struct Message {
    pub message_id: String,
    pub application_id: String,
    pub correlation_id: String,
    /// Assigned by the broker on delivery, empty when publishing
    pub delivery_tag: String,
    pub content_type: String,
    pub creation_date_time: DateTime<Utc>,
    pub body: Bytes,
}

impl Message {
    /// Serialize `body` into a new outbound message
    pub fn json<T: Serialize>(body: &T, correlation_id: impl Into<String>) -> serde_json::Result<Self> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            application_id: APPLICATION_ID.to_string(),
            correlation_id: correlation_id.into(),
            delivery_tag: String::new(),
            content_type: CONTENT_TYPE_JSON.to_string(),
            creation_date_time: Utc::now(),
            body: Bytes::from(serde_json::to_vec(body)?),
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}
