// src/storage/dedup.rs

//! Time-windowed notification history.
//!
//! A `(source_id, item_hash)` pair is notified at most once per window.
//! The check and the insert happen in one `BEGIN DEFERRED` transaction on a
//! fresh connection; lock contention (`SQLITE_BUSY` / `SQLITE_LOCKED`) makes
//! the whole transaction retry with backoff.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, ErrorCode, OptionalExtension, TransactionBehavior, params};
use thiserror::Error;

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::resilience::{BackoffPolicy, Exhausted};

/// Milliseconds SQLite waits on a lock before reporting `SQLITE_BUSY`.
const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Dedup store failures. All of them are expected at runtime.
#[derive(Debug, Error)]
pub enum DedupError {
    /// Lock contention outlasted the retry budget
    #[error("dedup store unavailable after {attempts} attempt(s): {last_error}")]
    Unavailable {
        attempts: u32,
        last_error: rusqlite::Error,
    },

    /// Any other SQLite failure
    #[error("dedup store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The blocking worker panicked or was cancelled
    #[error("dedup worker failed: {0}")]
    Worker(String),
}

impl DedupError {
    /// Lock contention that a fresh transaction may get past.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(e) => is_busy(e),
            _ => false,
        }
    }
}

fn is_busy(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(f.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Notification history.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether `item_hash` of `source_id` should be notified now. A `true`
    /// answer is recorded in the same transaction.
    async fn should_notify(
        &self,
        source_id: &str,
        item_hash: &str,
    ) -> std::result::Result<bool, DedupError>;

    /// Delete records older than `retention` (never shorter than the
    /// window). Returns the number removed.
    async fn prune(&self, retention: chrono::Duration) -> std::result::Result<usize, DedupError>;

    /// Number of stored records.
    async fn count(&self) -> std::result::Result<u64, DedupError>;
}

/// SQLite-backed [`DedupStore`].
#[derive(Clone)]
pub struct SqliteDedupStore {
    path: PathBuf,
    window: chrono::Duration,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
}

impl SqliteDedupStore {
    /// Open (creating if needed) the database at `path`.
    ///
    /// Failure here is fatal at startup.
    pub fn open(path: impl Into<PathBuf>, window: chrono::Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| AppError::storage(parent.display().to_string(), e))?;
        }

        let conn = connect(&path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            log::warn!("{}: journal mode is {mode}, expected wal", path.display());
        }
        conn.execute_batch(
            "PRAGMA synchronous=NORMAL;
             CREATE TABLE IF NOT EXISTS notifications (
                 source_id      TEXT NOT NULL,
                 item_hash      TEXT NOT NULL,
                 first_notified INTEGER NOT NULL,
                 PRIMARY KEY (source_id, item_hash)
             ) WITHOUT ROWID;
             CREATE INDEX IF NOT EXISTS idx_notifications_first_notified
                 ON notifications(first_notified);",
        )?;
        log::info!("Notification history ready at {} (WAL)", path.display());

        Ok(Self {
            path,
            window,
            clock,
            backoff: BackoffPolicy::default(),
        })
    }

    /// Run `work` on a fresh connection in a blocking worker, retrying the
    /// whole unit while the database is locked.
    async fn with_retry<T, F>(&self, label: &str, work: F) -> std::result::Result<T, DedupError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection, i64) -> rusqlite::Result<T> + Send + Sync + Clone + 'static,
    {
        let result = self
            .backoff
            .retry(
                label,
                || {
                    let path = self.path.clone();
                    let now = self.clock.now().timestamp();
                    let work = work.clone();
                    async move {
                        tokio::task::spawn_blocking(move || {
                            let mut conn = connect(&path)?;
                            work(&mut conn, now).map_err(DedupError::from)
                        })
                        .await
                        .map_err(|e| DedupError::Worker(e.to_string()))?
                    }
                },
                DedupError::is_transient,
            )
            .await;

        result.map_err(|Exhausted { attempts, error, .. }| match error {
            DedupError::Sqlite(e) if is_busy(&e) => {
                log::warn!("{label}: database still locked after {attempts} attempt(s)");
                DedupError::Unavailable {
                    attempts,
                    last_error: e,
                }
            }
            other => other,
        })
    }
}

fn connect(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}

#[async_trait]
impl DedupStore for SqliteDedupStore {
    async fn should_notify(
        &self,
        source_id: &str,
        item_hash: &str,
    ) -> std::result::Result<bool, DedupError> {
        let source_id = source_id.to_string();
        let item_hash = item_hash.to_string();
        let window = self.window.num_seconds();

        self.with_retry("dedup", move |conn, now| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let first: Option<i64> = tx
                .query_row(
                    "SELECT first_notified FROM notifications
                     WHERE source_id = ?1 AND item_hash = ?2",
                    params![source_id, item_hash],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(first) = first {
                if now - first < window {
                    tx.commit()?;
                    return Ok(false);
                }
            }
            tx.execute(
                "INSERT OR REPLACE INTO notifications (source_id, item_hash, first_notified)
                 VALUES (?1, ?2, ?3)",
                params![source_id, item_hash, now],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn prune(&self, retention: chrono::Duration) -> std::result::Result<usize, DedupError> {
        // Records inside the window are still live.
        let retention = retention.max(self.window).num_seconds();
        let removed = self
            .with_retry("dedup prune", move |conn, now| {
                conn.execute(
                    "DELETE FROM notifications WHERE first_notified < ?1",
                    params![now - retention],
                )
            })
            .await?;
        if removed > 0 {
            log::debug!("Pruned {removed} notification record(s)");
        }
        Ok(removed)
    }

    async fn count(&self) -> std::result::Result<u64, DedupError> {
        self.with_retry("dedup count", |conn, _| {
            conn.query_row("SELECT COUNT(*) FROM notifications", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n.max(0) as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn store(dir: &Path) -> (SqliteDedupStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let store = SqliteDedupStore::open(
            dir.join("notifications.db"),
            chrono::Duration::hours(6),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (store, clock)
    }

    #[tokio::test]
    async fn test_window_suppresses_then_rearms() {
        let dir = tempdir().unwrap();
        let (store, clock) = store(dir.path());

        assert!(store.should_notify("shop", "abc").await.unwrap());
        clock.advance(chrono::Duration::hours(1));
        assert!(!store.should_notify("shop", "abc").await.unwrap());
        clock.advance(chrono::Duration::hours(6));
        assert!(store.should_notify("shop", "abc").await.unwrap());
        clock.advance(chrono::Duration::hours(1));
        assert!(!store.should_notify("shop", "abc").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_per_source() {
        let dir = tempdir().unwrap();
        let (store, _) = store(dir.path());
        assert!(store.should_notify("a", "x").await.unwrap());
        assert!(store.should_notify("b", "x").await.unwrap());
        assert!(!store.should_notify("a", "x").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_records() {
        let dir = tempdir().unwrap();
        let (store, clock) = store(dir.path());
        store.should_notify("shop", "old").await.unwrap();
        clock.advance(chrono::Duration::hours(20));
        store.should_notify("shop", "new").await.unwrap();
        clock.advance(chrono::Duration::hours(5));

        let removed = store.prune(chrono::Duration::hours(24)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(!store.should_notify("shop", "new").await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_keeps_records_inside_window() {
        let dir = tempdir().unwrap();
        let (store, clock) = store(dir.path());
        assert!(store.should_notify("b", "x").await.unwrap());
        clock.advance(chrono::Duration::hours(2));

        let removed = store.prune(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 0);
        assert!(!store.should_notify("b", "x").await.unwrap());

        clock.advance(chrono::Duration::hours(5));
        assert_eq!(store.prune(chrono::Duration::hours(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempdir().unwrap();
        let (first, clock) = store(dir.path());
        assert!(first.should_notify("shop", "abc").await.unwrap());
        drop(first);

        let reopened = SqliteDedupStore::open(
            dir.path().join("notifications.db"),
            chrono::Duration::hours(6),
            Arc::new(clock),
        )
        .unwrap();
        assert!(!reopened.should_notify("shop", "abc").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_have_single_winner() {
        let dir = tempdir().unwrap();
        let (store, _) = store(dir.path());
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.should_notify("shop", "same-item").await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[test]
    fn test_busy_errors_are_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(DedupError::Sqlite(busy).is_transient());
        assert!(!DedupError::Worker("panic".into()).is_transient());
    }
}
