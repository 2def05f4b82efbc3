//! Groups incoming files into payloads keyed by correlation key.
//!
//! Producers call [`PayloadAssembler::add`]. A single coordinator task owns
//! every state transition: it keeps one timer per open key, closes payloads
//! whose inactivity timeout elapsed, hands their files to the upload queue and
//! forwards fully uploaded payloads to the notifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{delay_queue, DelayQueue};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::models::{FileRecord, Payload, PayloadState};
use crate::queue::WorkQueue;
use crate::storage::AdmissionGate;

type SharedPayload = Arc<Mutex<Payload>>;

#[derive(Debug, Error)]
pub enum AccumulatorError {
    #[error("payload assembler is shut down")]
    ShutDown,
}

#[derive(Debug, Clone)]
pub struct AssemblerSettings {
    pub payload_timeout: Duration,
    pub check_interval: Duration,
}

impl From<&StorageConfig> for AssemblerSettings {
    fn from(config: &StorageConfig) -> Self {
        Self {
            payload_timeout: config.payload_timeout(),
            check_interval: config.payload_check_interval(),
        }
    }
}

#[derive(Debug)]
struct Touch {
    key: String,
    deadline: Instant,
}

pub struct PayloadAssembler {
    open: Arc<DashMap<String, SharedPayload>>,
    touches: mpsc::UnboundedSender<Touch>,
    admission: Arc<dyn AdmissionGate>,
    default_timeout: Duration,
}

impl std::fmt::Debug for PayloadAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadAssembler")
            .field("open", &self.open.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl PayloadAssembler {
    /// Create the assembler and spawn its coordinator.
    ///
    /// Closed payloads' files go to `uploads`; fully uploaded payloads go to
    /// `notifications`.
    pub fn start(
        settings: AssemblerSettings,
        admission: Arc<dyn AdmissionGate>,
        uploads: WorkQueue<Arc<FileRecord>>,
        notifications: WorkQueue<Payload>,
        cancel: CancellationToken,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let open = Arc::new(DashMap::new());
        let (touches, touch_rx) = mpsc::unbounded_channel();

        let assembler = Arc::new(Self {
            open: open.clone(),
            touches,
            admission,
            default_timeout: settings.payload_timeout,
        });

        let coordinator = Coordinator {
            open,
            touches: touch_rx,
            timers: DelayQueue::new(),
            timer_keys: HashMap::new(),
            in_flight: Vec::new(),
            uploads,
            notifications,
        };
        let handle = tokio::spawn(coordinator.run(settings.check_interval, cancel));
        (assembler, handle)
    }

    /// Add `file` to the open payload for `key` using the default timeout
    pub fn add(&self, key: &str, file: FileRecord) -> Result<Uuid, AccumulatorError> {
        self.add_with_timeout(key, file, self.default_timeout)
    }

    /// Add `file` to the open payload for `key`, creating it with `timeout`
    /// if none is open. Returns the payload id.
    ///
    /// Adding a file id already present in the payload only restarts the
    /// inactivity timer.
    pub fn add_with_timeout(&self, key: &str, file: FileRecord, timeout: Duration) -> Result<Uuid, AccumulatorError> {
        if self.touches.is_closed() {
            return Err(AccumulatorError::ShutDown);
        }
        let file = Arc::new(file);

        loop {
            // The map guard is dropped at the end of this statement, before
            // the payload lock is taken.
            let payload = self
                .open
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(Payload::new(key, file.correlation_id.clone(), timeout)))
                })
                .clone();

            let mut guard = lock(&payload);
            if guard.state() != PayloadState::Created {
                // Closed by the coordinator after we looked it up
                continue;
            }
            if !guard.add(file.clone()) {
                tracing::debug!(key, file_id = %file.id, "File already in payload");
            }
            let touch = Touch {
                key: key.to_string(),
                deadline: guard.deadline(),
            };
            let payload_id = guard.id;
            drop(guard);

            self.touches
                .send(touch)
                .map_err(|_| AccumulatorError::ShutDown)?;
            return Ok(payload_id);
        }
    }

    /// Producers ask this before accepting new data
    pub fn has_space_for_store(&self) -> bool {
        self.admission.has_space_for_store()
    }

    /// Number of payloads still accepting files
    pub fn active_payloads(&self) -> usize {
        self.open.len()
    }
}

struct Coordinator {
    open: Arc<DashMap<String, SharedPayload>>,
    touches: mpsc::UnboundedReceiver<Touch>,
    timers: DelayQueue<String>,
    timer_keys: HashMap<String, delay_queue::Key>,
    in_flight: Vec<SharedPayload>,
    uploads: WorkQueue<Arc<FileRecord>>,
    notifications: WorkQueue<Payload>,
}

impl Coordinator {
    async fn run(mut self, check_interval: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(touch) = self.touches.recv() => self.arm(touch.key, touch.deadline),
                Some(expired) = self.timers.next(), if !self.timers.is_empty() => {
                    self.on_expired(expired.into_inner());
                }
                _ = interval.tick() => self.check_in_flight(),
            }
        }

        self.touches.close();
        if !self.open.is_empty() || !self.in_flight.is_empty() {
            tracing::warn!(
                open = self.open.len(),
                in_flight = self.in_flight.len(),
                "Payload coordinator stopping with unfinished payloads; files remain on disk"
            );
        }
    }

    fn arm(&mut self, key: String, deadline: Instant) {
        match self.timer_keys.get(&key) {
            Some(timer) => self.timers.reset_at(timer, deadline),
            None => {
                let timer = self.timers.insert_at(key.clone(), deadline);
                self.timer_keys.insert(key, timer);
            }
        }
    }

    fn on_expired(&mut self, key: String) {
        self.timer_keys.remove(&key);

        let closed = self.open.remove_if(&key, |_, payload| {
            let mut guard = lock(payload);
            if guard.state() == PayloadState::Created && guard.has_timed_out() {
                guard.set_state(PayloadState::Upload);
                true
            } else {
                false
            }
        });

        match closed {
            Some((_, payload)) => {
                {
                    let guard = lock(&payload);
                    tracing::info!(
                        payload_id = %guard.id,
                        key = %guard.key,
                        files = guard.count(),
                        "Payload complete, queueing files for upload"
                    );
                    for file in guard.files() {
                        if let Err(e) = self.uploads.enqueue(file.clone()) {
                            tracing::error!("Unable to queue file {} for upload: {}", file.id, e);
                        }
                    }
                }
                self.in_flight.push(payload);
            }
            None => {
                // Touched since the timer was armed
                let deadline = self.open.get(&key).map(|payload| lock(&payload).deadline());
                if let Some(deadline) = deadline {
                    self.arm(key, deadline);
                }
            }
        }
    }

    fn check_in_flight(&mut self) {
        let mut still_waiting = Vec::with_capacity(self.in_flight.len());

        for payload in self.in_flight.drain(..) {
            let (complete, failed, id) = {
                let guard = lock(&payload);
                (guard.is_upload_complete(), guard.has_failed_uploads(), guard.id)
            };

            if complete {
                lock(&payload).set_state(PayloadState::Notify);
                match Arc::try_unwrap(payload) {
                    Ok(mutex) => {
                        let payload = mutex.into_inner().unwrap_or_else(|p| p.into_inner());
                        tracing::info!(payload_id = %id, "Payload uploaded, ready for notification");
                        if let Err(e) = self.notifications.enqueue(payload) {
                            tracing::error!("Unable to queue payload {} for notification: {}", id, e);
                        }
                    }
                    // A producer that raced the close still holds a handle
                    Err(shared) => still_waiting.push(shared),
                }
            } else if failed {
                let guard = lock(&payload);
                let failed_files: Vec<String> = guard
                    .files()
                    .iter()
                    .filter(|f| !f.is_uploaded())
                    .map(|f| f.id.to_string())
                    .collect();
                tracing::error!(
                    payload_id = %id,
                    key = %guard.key,
                    failed = ?failed_files,
                    "Payload abandoned after upload failures; files kept on disk"
                );
            } else {
                still_waiting.push(payload);
            }
        }

        self.in_flight = still_waiting;
    }
}

fn lock(payload: &Mutex<Payload>) -> MutexGuard<'_, Payload> {
    payload.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
