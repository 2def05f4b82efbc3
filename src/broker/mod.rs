use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::models::Message;

pub mod memory;

pub use memory::InMemoryBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("unknown delivery tag '{0}'")]
    UnknownDelivery(String),
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

/// Callback invoked for every delivered message.
///
/// The handler owns the outcome and must eventually acknowledge or reject
/// the delivery through the broker.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Message bus the gateway publishes events to and consumes requests from
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError>;

    /// Bind `queue` to `topic` and start delivering to `handler`
    async fn subscribe(&self, topic: &str, queue: &str, handler: MessageHandler) -> Result<(), BrokerError>;

    async fn unsubscribe(&self, queue: &str) -> Result<(), BrokerError>;

    async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError>;

    /// Negative acknowledgement; with `requeue` the message is delivered again
    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), BrokerError>;
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}
