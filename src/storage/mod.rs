// src/storage/mod.rs

//! Persistence for the watcher.
//!
//! - Snapshots: one JSON file per source, replaced atomically
//! - Notification history: SQLite table keyed by `(source_id, item_hash)`
//!
//! ## Directory Structure
//!
//! ```text
//! data/
//! ├── snapshots/
//! │   ├── hatosya.json
//! │   └── kitamura.json
//! └── notifications.db      # WAL mode, plus -wal/-shm side files
//! ```

pub mod dedup;
pub mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::StoredSnapshot;

// Re-export for convenience
pub use dedup::{DedupError, DedupStore, SqliteDedupStore};
pub use local::LocalSnapshotStore;

/// Trait for snapshot storage backends.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Last stored snapshot of a source, `None` on cold start.
    async fn load(&self, source_id: &str) -> Result<Option<StoredSnapshot>>;

    /// Replace the stored snapshot wholesale. Readers see either the old or
    /// the new snapshot, never a partial one.
    async fn save(&self, snapshot: &StoredSnapshot) -> Result<()>;
}
