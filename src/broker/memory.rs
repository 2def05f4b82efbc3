//! Process-local broker for standalone mode and tests.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{BrokerError, MessageBroker, MessageHandler};
use crate::models::Message;

const REDELIVERY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct QueueBinding {
    topic: String,
    sender: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    queues: DashMap<String, QueueBinding>,
    /// Delivered but not yet settled, by delivery tag
    in_flight: DashMap<String, (String, Message)>,
    published: Mutex<Vec<(String, Message)>>,
    acknowledged: Mutex<Vec<Message>>,
    rejected: Mutex<Vec<(Message, bool)>>,
    /// Requeued while nothing consumed the queue, delivered on the next subscribe
    parked: DashMap<String, Vec<Message>>,
    next_tag: AtomicU64,
    failing_publishes: AtomicU32,
}

/// Topic fan-out to named queues, with at-least-once redelivery on reject
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail with [`BrokerError::Unavailable`]
    pub fn fail_next_publishes(&self, count: u32) {
        self.inner.failing_publishes.store(count, Ordering::SeqCst);
    }

    /// Messages successfully published to `topic`, oldest first
    pub fn published(&self, topic: &str) -> Vec<Message> {
        lock(&self.inner.published)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn acknowledged(&self) -> Vec<Message> {
        lock(&self.inner.acknowledged).clone()
    }

    /// Rejected messages with their requeue flag
    pub fn rejected(&self) -> Vec<(Message, bool)> {
        lock(&self.inner.rejected).clone()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    fn settle(&self, message: &Message) -> Result<(String, Message), BrokerError> {
        self.inner
            .in_flight
            .remove(&message.delivery_tag)
            .map(|(_, entry)| entry)
            .ok_or_else(|| BrokerError::UnknownDelivery(message.delivery_tag.clone()))
    }

    fn spawn_dispatcher(
        &self,
        queue: String,
        mut receiver: mpsc::UnboundedReceiver<Message>,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let mut message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(message) => message,
                        None => break,
                    },
                };
                let tag = inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                message.delivery_tag = tag.to_string();
                inner
                    .in_flight
                    .insert(message.delivery_tag.clone(), (queue.clone(), message.clone()));
                handler(message).await;
            }
            tracing::debug!("Dispatcher for queue '{}' stopped", queue);
        });
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BrokerError> {
        let failing = self
            .inner
            .failing_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BrokerError::Unavailable(format!("publish to '{}' refused", topic)));
        }

        for binding in self.inner.queues.iter().filter(|b| b.topic == topic) {
            let _ = binding.sender.send(message.clone());
        }
        tracing::debug!(topic, message_id = %message.message_id, "Published message");
        lock(&self.inner.published).push((topic.to_string(), message));
        Ok(())
    }

    async fn subscribe(&self, topic: &str, queue: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let binding = QueueBinding {
            topic: topic.to_string(),
            sender,
            cancel: cancel.clone(),
        };
        if let Some((_, parked)) = self.inner.parked.remove(queue) {
            for message in parked {
                let _ = binding.sender.send(message);
            }
        }
        if let Some(previous) = self.inner.queues.insert(queue.to_string(), binding) {
            previous.cancel.cancel();
        }
        self.spawn_dispatcher(queue.to_string(), receiver, handler, cancel);
        tracing::info!("Queue '{}' subscribed to '{}'", queue, topic);
        Ok(())
    }

    async fn unsubscribe(&self, queue: &str) -> Result<(), BrokerError> {
        if let Some((_, binding)) = self.inner.queues.remove(queue) {
            binding.cancel.cancel();
            tracing::info!("Queue '{}' unsubscribed from '{}'", queue, binding.topic);
        }
        Ok(())
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), BrokerError> {
        let (_, original) = self.settle(message)?;
        lock(&self.inner.acknowledged).push(original);
        Ok(())
    }

    async fn reject(&self, message: &Message, requeue: bool) -> Result<(), BrokerError> {
        let (queue, original) = self.settle(message)?;
        lock(&self.inner.rejected).push((original.clone(), requeue));

        if requeue {
            let sender = self.inner.queues.get(&queue).map(|b| b.sender.clone());
            match sender {
                Some(sender) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(REDELIVERY_DELAY).await;
                        let _ = sender.send(original);
                    });
                }
                None => self.inner.parked.entry(queue).or_default().push(original),
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
