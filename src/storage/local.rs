// src/storage/local.rs

//! Local filesystem snapshot storage.
//!
//! Every write goes to a uniquely named temp file in the same directory,
//! is synced to disk, then renamed over the target, so a concurrent reader
//! always sees a complete file.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::models::StoredSnapshot;
use crate::storage::SnapshotStore;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Snapshot files under one directory, named `{source_id}.json`.
#[derive(Debug, Clone)]
pub struct LocalSnapshotStore {
    root_dir: PathBuf,
}

impl LocalSnapshotStore {
    /// Create a store rooted at `root_dir`, creating the directory if needed.
    pub fn open(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)
            .map_err(|e| AppError::storage(root_dir.display().to_string(), e))?;
        Ok(Self { root_dir })
    }

    /// Full path of a source's snapshot file.
    fn path(&self, source_id: &str) -> PathBuf {
        self.root_dir.join(format!("{source_id}.json"))
    }

    fn tmp_path(&self, source_id: &str) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root_dir
            .join(format!(".{source_id}.{}.{n}.tmp", std::process::id()))
    }

    /// Write bytes atomically (write to temp, sync, then rename).
    async fn write_bytes(&self, source_id: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(source_id);
        let tmp = self.tmp_path(source_id);

        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(AppError::storage(path.display().to_string(), e));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn load(&self, source_id: &str) -> Result<Option<StoredSnapshot>> {
        let path = self.path(source_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::storage(path.display().to_string(), e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                log::warn!(
                    "[{}] unreadable snapshot {}: {}; treating as cold start",
                    source_id,
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    async fn save(&self, snapshot: &StoredSnapshot) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        self.write_bytes(&snapshot.source_id, &bytes).await?;
        log::debug!(
            "[{}] snapshot saved ({} items)",
            snapshot.source_id,
            snapshot.records.len()
        );
        Ok(())
    }
}
