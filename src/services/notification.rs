//! Publishes workflow requests for fully uploaded payloads.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{BrokerError, MessageBroker};
use crate::config::RetryConfig;
use crate::models::{Message, Payload, PayloadState, WorkflowRequestEvent};
use crate::queue::WorkQueue;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("payload {payload_id} is in state {state:?}, expected Notify")]
    InvalidState { payload_id: Uuid, state: PayloadState },
    #[error("failed to encode workflow request: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct PayloadNotificationService {
    broker: Arc<dyn MessageBroker>,
    queue: WorkQueue<Payload>,
    topic: String,
    bucket: String,
    retries: RetryConfig,
}

impl PayloadNotificationService {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queue: WorkQueue<Payload>,
        topic: impl Into<String>,
        bucket: impl Into<String>,
        retries: RetryConfig,
    ) -> Self {
        Self {
            broker,
            queue,
            topic: topic.into(),
            bucket: bucket.into(),
            retries,
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(payload) = self.queue.dequeue(&cancel).await {
                self.handle(payload, &cancel);
                tokio::task::yield_now().await;
            }
            tracing::debug!("Payload notification service stopped");
        })
    }

    fn handle(self: &Arc<Self>, payload: Payload, cancel: &CancellationToken) {
        let service = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut payload = payload;
            match service.notify(&payload).await {
                Ok(()) => {}
                Err(e @ NotificationError::InvalidState { .. }) => {
                    tracing::error!("Refusing to notify: {}", e);
                }
                Err(e) => {
                    if !payload.can_retry() {
                        tracing::warn!(
                            payload_id = %payload.id,
                            attempts = payload.retry_count(),
                            "Giving up on workflow request after repeated failures: {}",
                            e
                        );
                        return;
                    }
                    let delay = service.retries.delay_for(payload.retry_count());
                    tracing::warn!(
                        payload_id = %payload.id,
                        retry = payload.retry_count(),
                        "Workflow request failed: {}; retrying in {:?}",
                        e,
                        delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {
                            if let Err(e) = service.queue.enqueue(payload) {
                                tracing::error!("Unable to requeue payload for notification: {}", e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Publish the workflow request for a payload in `Notify` state
    #[tracing::instrument(skip_all, fields(payload_id = %payload.id))]
    pub async fn notify(&self, payload: &Payload) -> Result<(), NotificationError> {
        if payload.state() != PayloadState::Notify {
            return Err(NotificationError::InvalidState {
                payload_id: payload.id,
                state: payload.state(),
            });
        }

        let event = WorkflowRequestEvent::from_payload(payload, &self.bucket);
        let message = Message::json(&event, payload.correlation_id.clone())?;
        self.broker.publish(&self.topic, message).await?;

        tracing::info!(
            files = payload.count(),
            workflows = ?event.workflows,
            "Workflow request published"
        );
        Ok(())
    }
}
