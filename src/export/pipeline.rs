//! Staged export pipeline shared by every protocol.
//!
//! Intake (broker handler) -> fetch -> plugins + delivery -> report, joined by
//! bounded channels. Each stage runs `concurrency` workers; the supervisor
//! task ends once every stage has drained.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::broker::{handler, BrokerError, MessageBroker};
use crate::config::RetryConfig;
use crate::export::{
    DeliveryError, ExportError, ExportTransport, PluginRegistry, DOWNLOAD_FAILED, NO_DESTINATION,
};
use crate::models::{
    ExportCompleteEvent, ExportRequestDataMessage, ExportRequestEvent, ExportTaskState, FileExportStatus,
    Message,
};
use crate::retry::{with_retry, with_retry_cancellable};
use crate::storage::{AdmissionGate, ObjectStore, StorageError};

/// Collaborators shared by all export services
#[derive(Clone)]
pub struct ExportContext {
    pub broker: Arc<dyn MessageBroker>,
    pub store: Arc<dyn ObjectStore>,
    pub admission: Arc<dyn AdmissionGate>,
    pub plugins: Arc<PluginRegistry>,
    /// Bucket export requests refer to
    pub bucket: String,
    pub retries: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTopics {
    /// Topic the service consumes; also used as its queue name
    pub request: String,
    pub complete: String,
}

/// Upper bound on waiting for workers once they have been cancelled
const CANCEL_GRACE: Duration = Duration::from_millis(500);

struct Running {
    supervisor: JoinHandle<()>,
    cancel: CancellationToken,
}

struct Inner<T> {
    name: String,
    transport: T,
    ctx: ExportContext,
    topics: ExportTopics,
    concurrency: usize,
    retry_delays: Vec<Duration>,
    tasks: DashMap<String, Arc<ExportTaskState>>,
    intake: std::sync::Mutex<Option<mpsc::Sender<ExportRequestDataMessage>>>,
}

pub struct ExportService<T: ExportTransport> {
    inner: Arc<Inner<T>>,
    running: Mutex<Option<Running>>,
}

impl<T: ExportTransport> ExportService<T> {
    pub fn new(
        name: impl Into<String>,
        transport: T,
        ctx: ExportContext,
        topics: ExportTopics,
        concurrency: usize,
    ) -> Self {
        let retry_delays = ctx.retries.delays();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                transport,
                ctx,
                topics,
                concurrency: concurrency.max(1),
                retry_delays,
                tasks: DashMap::new(),
                intake: std::sync::Mutex::new(None),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn topics(&self) -> &ExportTopics {
        &self.inner.topics
    }

    /// Export tasks received but not yet completed
    pub fn active_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    /// Spawn the stage workers and subscribe to the request topic
    pub async fn start(&self, parent: &CancellationToken) -> Result<(), ExportError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ExportError::AlreadyRunning(self.inner.name.clone()));
        }

        let cancel = parent.child_token();
        let capacity = self.inner.concurrency * 2;
        let (intake_tx, intake_rx) = mpsc::channel(capacity);
        let (fetched_tx, fetched_rx) = mpsc::channel(capacity);
        let (delivered_tx, delivered_rx) = mpsc::channel(capacity);
        let intake_rx = Arc::new(Mutex::new(intake_rx));
        let fetched_rx = Arc::new(Mutex::new(fetched_rx));
        let delivered_rx = Arc::new(Mutex::new(delivered_rx));

        let mut workers = JoinSet::new();
        for _ in 0..self.inner.concurrency {
            let (inner, rx, tx, worker_cancel) =
                (self.inner.clone(), intake_rx.clone(), fetched_tx.clone(), cancel.clone());
            workers.spawn(async move {
                while let Some(message) = next(&rx, &worker_cancel).await {
                    let message = inner.fetch(message, &worker_cancel).await;
                    // Work cut short by cancellation is requeued, never reported
                    if worker_cancel.is_cancelled() || tx.send(message).await.is_err() {
                        break;
                    }
                }
            });

            let (inner, rx, tx, worker_cancel) =
                (self.inner.clone(), fetched_rx.clone(), delivered_tx.clone(), cancel.clone());
            workers.spawn(async move {
                while let Some(message) = next(&rx, &worker_cancel).await {
                    let message = inner.deliver(message, &worker_cancel).await;
                    // Work cut short by cancellation is requeued, never reported
                    if worker_cancel.is_cancelled() || tx.send(message).await.is_err() {
                        break;
                    }
                }
            });

            let (inner, rx, worker_cancel) = (self.inner.clone(), delivered_rx.clone(), cancel.clone());
            workers.spawn(async move {
                while let Some(message) = next(&rx, &worker_cancel).await {
                    inner.report(message).await;
                }
            });
        }
        // Downstream stages end when every upstream worker has dropped its sender
        drop(fetched_tx);
        drop(delivered_tx);

        let name = self.inner.name.clone();
        let supervisor = tokio::spawn(async move {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    tracing::error!("Export worker of '{}' failed: {}", name, e);
                }
            }
            tracing::debug!("Export pipeline '{}' drained", name);
        });

        *lock_intake(&self.inner.intake) = Some(intake_tx);

        let inner = self.inner.clone();
        let subscription = self
            .inner
            .ctx
            .broker
            .subscribe(
                &self.inner.topics.request,
                &self.inner.topics.request,
                handler(move |message| {
                    let inner = inner.clone();
                    async move { inner.on_message(message).await }
                }),
            )
            .await;

        if let Err(e) = subscription {
            lock_intake(&self.inner.intake).take();
            cancel.cancel();
            let _ = supervisor.await;
            return Err(e.into());
        }

        tracing::info!(
            "Export service '{}' ({}) listening on '{}' with {} workers per stage",
            self.inner.name,
            self.inner.transport.name(),
            self.inner.topics.request,
            self.inner.concurrency
        );
        *running = Some(Running { supervisor, cancel });
        Ok(())
    }

    /// Unsubscribe, let queued work drain, and wait up to `timeout`.
    ///
    /// Work still in flight after the timeout is cancelled and its tasks are
    /// requeued on the broker.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ExportError> {
        let Some(mut running) = self.running.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = self.inner.ctx.broker.unsubscribe(&self.inner.topics.request).await {
            tracing::warn!("Unable to unsubscribe '{}': {}", self.inner.topics.request, e);
        }
        lock_intake(&self.inner.intake).take();

        match tokio::time::timeout(timeout, &mut running.supervisor).await {
            Ok(_) => {
                let abandoned = self.inner.requeue_unfinished().await;
                tracing::info!("Export service '{}' stopped ({} tasks requeued)", self.inner.name, abandoned);
                Ok(())
            }
            Err(_) => {
                running.cancel.cancel();
                // Dropping the supervisor drops its JoinSet, which aborts stragglers
                let grace = timeout.min(CANCEL_GRACE);
                if tokio::time::timeout(grace, &mut running.supervisor).await.is_err() {
                    running.supervisor.abort();
                    let _ = running.supervisor.await;
                }
                let abandoned = self.inner.requeue_unfinished().await;
                tracing::warn!(
                    "Export service '{}' cancelled, {} unfinished tasks requeued",
                    self.inner.name,
                    abandoned
                );
                Err(ExportError::ShutdownTimeout(self.inner.name.clone()))
            }
        }
    }
}

impl<T: ExportTransport> Inner<T> {
    fn intake_sender(&self) -> Option<mpsc::Sender<ExportRequestDataMessage>> {
        lock_intake(&self.intake).clone()
    }

    fn settle(&self, outcome: Result<(), BrokerError>, action: &str, message: &Message) {
        if let Err(e) = outcome {
            tracing::error!("Failed to {} message {}: {}", action, message.message_id, e);
        }
    }

    async fn reject(&self, message: &Message, requeue: bool) {
        let outcome = self.ctx.broker.reject(message, requeue).await;
        self.settle(outcome, "reject", message);
    }

    /// Give every task still tracked back to the broker
    async fn requeue_unfinished(&self) -> usize {
        let ids: Vec<String> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        let mut requeued = 0;
        for id in ids {
            if let Some((_, task)) = self.tasks.remove(&id) {
                tracing::info!(task_id = %id, "Unfinished export task requeued");
                self.reject(&task.message, true).await;
                requeued += 1;
            }
        }
        requeued
    }

    #[tracing::instrument(skip_all, fields(service = %self.name, message_id = %message.message_id))]
    async fn on_message(&self, message: Message) {
        if !self.ctx.admission.has_space_for_export() {
            tracing::warn!("Insufficient storage space, export request requeued");
            self.reject(&message, true).await;
            return;
        }

        let request: ExportRequestEvent = match message.decode() {
            Ok(request) => request,
            Err(e) => {
                tracing::error!("Discarding malformed export request: {}", e);
                self.reject(&message, false).await;
                return;
            }
        };

        let Some(intake) = self.intake_sender() else {
            tracing::info!("Export service stopping, export request requeued");
            self.reject(&message, true).await;
            return;
        };

        let task = Arc::new(ExportTaskState::new(request.clone(), message.clone()));
        let accepted = match self.tasks.entry(request.export_task_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(task.clone());
                true
            }
        };
        if !accepted {
            tracing::warn!(task_id = %request.export_task_id, "Duplicate export task ignored");
            self.reject(&message, false).await;
            return;
        }

        tracing::info!(
            task_id = %request.export_task_id,
            files = request.files.len(),
            destinations = ?request.destinations,
            "Export task received"
        );

        if request.files.is_empty() {
            let event = task.empty_completion();
            self.complete(&task, event).await;
            return;
        }

        for file in &request.files {
            if intake
                .send(ExportRequestDataMessage::new(&request, file.clone()))
                .await
                .is_err()
            {
                tracing::error!(task_id = %request.export_task_id, "Export pipeline closed while queueing files");
                self.tasks.remove(&request.export_task_id);
                self.reject(&message, true).await;
                return;
            }
        }
    }

    async fn fetch(&self, mut message: ExportRequestDataMessage, cancel: &CancellationToken) -> ExportRequestDataMessage {
        let store = &self.ctx.store;
        let bucket = self.ctx.bucket.as_str();
        let file_id = message.file_id.clone();

        let result = with_retry_cancellable(
            "download",
            &self.retry_delays,
            cancel,
            StorageError::is_transient,
            || store.get(bucket, &file_id),
        )
        .await;

        match result {
            Ok(data) => message.data = Some(data),
            Err(e) => {
                tracing::error!(task_id = %message.export_task_id, file = %file_id, "Download failed: {}", e);
                message.set_failed(FileExportStatus::DownloadError, DOWNLOAD_FAILED);
            }
        }
        message
    }

    async fn deliver(&self, mut message: ExportRequestDataMessage, cancel: &CancellationToken) -> ExportRequestDataMessage {
        if message.is_failed() {
            return message;
        }
        let Some(data) = message.data.take() else {
            message.set_failed(FileExportStatus::DownloadError, DOWNLOAD_FAILED);
            return message;
        };

        let data = match self.ctx.plugins.apply(&message.plugins, &message, data).await {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(task_id = %message.export_task_id, "Output plugin failed: {}", e);
                message.set_failed(FileExportStatus::ConfigurationError, e.to_string());
                return message;
            }
        };

        if message.destinations.is_empty() {
            message.set_failed(FileExportStatus::ConfigurationError, NO_DESTINATION);
            return message;
        }

        for destination in message.destinations.clone() {
            let result = if destination.trim().is_empty() {
                Err(DeliveryError::Configuration(NO_DESTINATION.to_string()))
            } else {
                let operation = format!("{} export to '{}'", self.transport.name(), destination);
                let msg = &message;
                let data = &data;
                let destination = destination.as_str();
                with_retry_cancellable(
                    &operation,
                    &self.retry_delays,
                    cancel,
                    DeliveryError::is_retryable,
                    || self.transport.deliver(destination, msg, data),
                )
                .await
            };

            match result {
                Ok(()) => tracing::info!(
                    task_id = %message.export_task_id,
                    file = %message.file_id,
                    "Exported to '{}'",
                    destination
                ),
                Err(e) => {
                    tracing::error!(
                        task_id = %message.export_task_id,
                        file = %message.file_id,
                        "Export to '{}' failed: {}",
                        destination,
                        e
                    );
                    message.set_failed(e.file_status(), e.to_string());
                }
            }
        }
        message
    }

    async fn report(&self, message: ExportRequestDataMessage) {
        let Some(task) = self.tasks.get(&message.export_task_id).map(|t| t.value().clone()) else {
            tracing::warn!(task_id = %message.export_task_id, "Result for unknown export task dropped");
            return;
        };
        if let Some(event) = task.record(&message) {
            self.complete(&task, event).await;
        }
    }

    /// Acknowledge the request, then publish its completion event
    async fn complete(&self, task: &ExportTaskState, event: ExportCompleteEvent) {
        let broker = &self.ctx.broker;

        let acked = with_retry("acknowledge", &self.retry_delays, BrokerError::is_transient, || {
            broker.acknowledge(&task.message)
        })
        .await;
        self.settle(acked, "acknowledge", &task.message);

        match Message::json(&event, event.correlation_id.clone()) {
            Ok(message) => {
                let topic = self.topics.complete.as_str();
                let published = with_retry("publish export complete", &self.retry_delays, BrokerError::is_transient, || {
                    broker.publish(topic, message.clone())
                })
                .await;
                self.settle(published, "publish", &message);
            }
            Err(e) => tracing::error!("Unable to encode export completion: {}", e),
        }

        self.tasks.remove(&event.export_task_id);
        tracing::info!(
            task_id = %event.export_task_id,
            status = ?event.status,
            "Export task complete"
        );
    }
}

async fn next<M>(rx: &Mutex<mpsc::Receiver<M>>, cancel: &CancellationToken) -> Option<M> {
    let mut rx = tokio::select! {
        _ = cancel.cancelled() => return None,
        guard = rx.lock() => guard,
    };
    tokio::select! {
        _ = cancel.cancelled() => None,
        item = rx.recv() => item,
    }
}

fn lock_intake<M>(intake: &std::sync::Mutex<M>) -> std::sync::MutexGuard<'_, M> {
    intake.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Lets services over different transports be supervised together
#[async_trait::async_trait]
pub trait ExportHandle: Send + Sync {
    fn name(&self) -> &str;

    fn active_tasks(&self) -> usize;

    async fn stop(&self, timeout: Duration) -> Result<(), ExportError>;
}

#[async_trait::async_trait]
impl<T: ExportTransport> ExportHandle for ExportService<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn active_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    async fn stop(&self, timeout: Duration) -> Result<(), ExportError> {
        ExportService::<T>::stop(self, timeout).await
    }
}
