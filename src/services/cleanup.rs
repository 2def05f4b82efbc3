//! Reclaims local disk once files are safely in durable storage.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::models::FileRecord;
use crate::queue::WorkQueue;
use crate::retry::{exponential_delays, with_retry};

const DELETE_ATTEMPTS: u32 = 3;
const DELETE_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub struct SpaceReclaimer {
    root: PathBuf,
    queue: WorkQueue<Arc<FileRecord>>,
    delays: Vec<Duration>,
}

impl SpaceReclaimer {
    /// `root` is the temporary data directory; it is never removed
    pub fn new(root: impl Into<PathBuf>, queue: WorkQueue<Arc<FileRecord>>) -> Self {
        Self {
            root: root.into(),
            queue,
            delays: exponential_delays(DELETE_BASE_DELAY, DELETE_ATTEMPTS),
        }
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok(record) = self.queue.dequeue(&cancel).await {
                self.reclaim(&record).await;
            }
            tracing::debug!("Space reclaimer stopped");
        })
    }

    /// Delete the record's local files and any directories left empty.
    ///
    /// Records not yet confirmed at their final storage path are left alone.
    #[tracing::instrument(skip_all, fields(file_id = %record.id))]
    pub async fn reclaim(&self, record: &FileRecord) {
        if !record.is_moved() {
            tracing::warn!("Refusing to delete local files of a record not yet in storage");
            return;
        }

        for path in record.local_paths() {
            let result = with_retry("delete", &self.delays, |_| true, || delete_file(path)).await;
            match result {
                Ok(()) => tracing::debug!("Deleted {}", path.display()),
                Err(e) => tracing::error!("Unable to delete {}: {}", path.display(), e),
            }
        }

        if let Some(parent) = record.file.temporary_path.parent() {
            self.remove_empty_dirs(parent).await;
        }
    }

    /// Walk up from `dir` removing empty directories, stopping below the root
    async fn remove_empty_dirs(&self, dir: &Path) {
        let mut current = Some(dir);
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            match is_empty_dir(dir).await {
                Ok(true) => {
                    if let Err(e) = tokio::fs::remove_dir(dir).await {
                        if e.kind() != ErrorKind::NotFound {
                            tracing::warn!("Unable to remove directory {}: {}", dir.display(), e);
                            break;
                        }
                    }
                }
                Ok(false) => break,
                // Already cleaned up by a sibling record
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("Unable to inspect directory {}: {}", dir.display(), e);
                    break;
                }
            }
            current = dir.parent();
        }
    }
}

async fn delete_file(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

async fn is_empty_dir(dir: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}
