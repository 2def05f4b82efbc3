use crate::storage::{validate_key, ObjectInfo, ObjectMetadata, ObjectStore, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const METADATA_DIR: &str = ".metadata";

/// Filesystem-backed object store
///
/// Each bucket is a directory under the root. Content type and user metadata
/// live in a JSON companion file under `{root}/.metadata/{bucket}/{key}.json`
/// so that listings only ever see object content.
#[derive(Debug, Clone)]
pub struct FilesystemObjectStore {
    root_path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Companion {
    content_type: String,
    metadata: ObjectMetadata,
}

impl FilesystemObjectStore {
    /// Create a new store rooted at `root_path`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        Ok(Self { root_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.root_path
    }

    fn bucket_path(&self, bucket: &str) -> StorageResult<PathBuf> {
        if bucket.is_empty() || bucket.contains('/') || bucket.starts_with('.') {
            return Err(StorageError::Path(format!("invalid bucket name '{}'", bucket)));
        }
        Ok(self.root_path.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        Ok(self.bucket_path(bucket)?.join(key))
    }

    fn companion_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root_path
            .join(METADATA_DIR)
            .join(bucket)
            .join(format!("{}.json", key))
    }

    async fn read_companion(&self, bucket: &str, key: &str) -> Companion {
        match tokio::fs::read(self.companion_path(bucket, key)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!("Ignoring unreadable metadata for {}/{}: {}", bucket, key, e);
                Companion::default()
            }),
            Err(_) => Companion::default(),
        }
    }
}

impl Default for Companion {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            metadata: ObjectMetadata::new(),
        }
    }
}

/// Write through a sibling temporary file and rename, so readers never see a
/// partial object.
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = path.as_os_str().to_owned();
    partial.push(format!(".partial-{}", Uuid::new_v4()));
    let partial = PathBuf::from(partial);

    let file = async {
        let mut file = tokio::fs::File::create(&partial).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, contents).await?;
        file.sync_all().await
    };
    if let Err(e) = file.await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, path).await
}

#[async_trait]
impl ObjectStore for FilesystemObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: &str,
        metadata: &ObjectMetadata,
    ) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        let companion = Companion {
            content_type: content_type.to_string(),
            metadata: metadata.clone(),
        };

        write_atomic(&self.companion_path(bucket, key), &serde_json::to_vec(&companion)?).await?;
        write_atomic(&path, &data).await?;
        tracing::debug!("Stored {}/{} ({} bytes)", bucket, key, data.len());
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> StorageResult<Bytes> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found(bucket, key))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, bucket: &str, key: &str) -> StorageResult<bool> {
        let path = self.object_path(bucket, key)?;
        Ok(tokio::fs::try_exists(&path).await? && path.is_file())
    }

    async fn list(&self, bucket: &str, prefix: &str, recursive: bool) -> StorageResult<Vec<ObjectInfo>> {
        let bucket_path = self.bucket_path(bucket)?;
        if !bucket_path.exists() {
            return Ok(Vec::new());
        }

        let prefix_owned = prefix.to_string();
        let walk_root = bucket_path.clone();
        let entries = tokio::task::spawn_blocking(move || -> StorageResult<Vec<(String, u64, DateTime<Utc>)>> {
            let mut found = Vec::new();
            for entry in walkdir::WalkDir::new(&walk_root).min_depth(1) {
                let entry = entry.map_err(|e| StorageError::Path(e.to_string()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&walk_root)
                    .map_err(|e| StorageError::Path(e.to_string()))?;
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.contains(".partial-") || !key.starts_with(&prefix_owned) {
                    continue;
                }
                if !recursive && key[prefix_owned.len()..].trim_start_matches('/').contains('/') {
                    continue;
                }
                let meta = entry.metadata().map_err(|e| StorageError::Path(e.to_string()))?;
                let modified = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
                found.push((key, meta.len(), modified));
            }
            Ok(found)
        })
        .await
        .map_err(|e| StorageError::Unavailable(format!("listing task failed: {}", e)))??;

        let mut objects = Vec::with_capacity(entries.len());
        for (key, size, last_modified) in entries {
            let companion = self.read_companion(bucket, &key).await;
            objects.push(ObjectInfo {
                key,
                size,
                content_type: companion.content_type,
                metadata: companion.metadata,
                last_modified,
            });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}
