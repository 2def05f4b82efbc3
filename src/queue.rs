//! Unbounded multi-producer, multi-consumer work queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("dequeue cancelled")]
    Cancelled,
    #[error("queue closed")]
    Closed,
}

/// Cloneable handle; every clone feeds and drains the same queue.
///
/// `enqueue` never blocks. Consumers take turns on the receiver, so each
/// item is delivered to exactly one of them.
#[derive(Debug)]
pub struct WorkQueue<T> {
    sender: mpsc::UnboundedSender<T>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    pending: Arc<AtomicUsize>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl<T: Send> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> WorkQueue<T> {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn enqueue(&self, item: T) -> Result<(), QueueError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.sender.send(item).map_err(|_| {
            self.taken();
            QueueError::Closed
        })
    }

    /// Wait for the next item, or until `cancel` fires
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<T, QueueError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            item = async {
                let mut receiver = self.receiver.lock().await;
                receiver.recv().await
            } => {
                let item = item.ok_or(QueueError::Closed)?;
                self.taken();
                Ok(item)
            }
        }
    }

    /// Take an item if one is ready
    pub fn try_dequeue(&self) -> Option<T> {
        let mut receiver = self.receiver.try_lock().ok()?;
        let item = receiver.try_recv().ok()?;
        self.taken();
        Some(item)
    }

    fn taken(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Items enqueued but not yet taken
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
