// src/pipeline/diff.rs

//! Change detection between a fresh snapshot and the stored one.
//!
//! Items are matched by identity hash. An identity missing from the stored
//! snapshot is `Added`; one present with a different content hash is
//! `Changed`. Removals are not reported.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    ChangeKind, ChangedItem, ItemRecord, Snapshot, SourceConfig, StoredSnapshot,
};
use crate::pipeline::normalize::Normalizer;
use crate::storage::SnapshotStore;

/// Result of comparing a snapshot, before it is committed.
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    changed: Vec<ChangedItem>,
    next: StoredSnapshot,
    previous: HashMap<String, ItemRecord>,
    cold_start: bool,
    deferred: usize,
}

impl DiffOutcome {
    /// Items to report, in page order.
    pub fn changed(&self) -> &[ChangedItem] {
        &self.changed
    }

    /// Snapshot that [`ChangeDetector::commit`] will store.
    pub fn next(&self) -> &StoredSnapshot {
        &self.next
    }

    /// No snapshot was stored for this source before.
    pub fn is_cold_start(&self) -> bool {
        self.cold_start
    }

    /// Number of items rewound with [`DiffOutcome::defer`].
    pub fn deferred(&self) -> usize {
        self.deferred
    }

    /// Rewind one item to its previous record so the next comparison reports
    /// it again.
    pub fn defer(&mut self, identity: &str) {
        let Some(pos) = self.next.records.iter().position(|r| r.identity == identity) else {
            return;
        };
        match self.previous.get(identity) {
            Some(old) => self.next.records[pos] = old.clone(),
            None => {
                self.next.records.remove(pos);
            }
        }
        self.deferred += 1;
    }
}

/// Hash-based change detector backed by a [`SnapshotStore`].
#[derive(Clone)]
pub struct ChangeDetector {
    store: Arc<dyn SnapshotStore>,
    normalizer: Arc<Normalizer>,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn SnapshotStore>, normalizer: Arc<Normalizer>) -> Self {
        Self { store, normalizer }
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Compare `snapshot` with the stored snapshot of `source`.
    pub async fn compare(&self, source: &SourceConfig, snapshot: &Snapshot) -> Result<DiffOutcome> {
        let stored = self.store.load(&source.id).await?;
        let cold_start = stored.is_none();
        let previous: HashMap<String, ItemRecord> = stored
            .map(|s| {
                s.records
                    .into_iter()
                    .map(|r| (r.identity.clone(), r))
                    .collect()
            })
            .unwrap_or_default();

        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(snapshot.items.len());
        let mut changed = Vec::new();

        for item in &snapshot.items {
            let identity = self.normalizer.identity(item, &source.category);
            if !seen.insert(identity.clone()) {
                continue;
            }
            let content = self.normalizer.content_hash(item);

            let kind = match previous.get(&identity) {
                None => Some(ChangeKind::Added),
                Some(old) if old.content != content => Some(ChangeKind::Changed),
                Some(_) => None,
            };
            if let Some(kind) = kind {
                changed.push(ChangedItem {
                    identity: identity.clone(),
                    kind,
                    item: item.clone(),
                });
            }
            records.push(ItemRecord {
                identity,
                content,
                name: item.name.clone(),
            });
        }

        log::debug!(
            "[{}] {} items, {} new/changed{}",
            source.id,
            records.len(),
            changed.len(),
            if cold_start { " (cold start)" } else { "" }
        );

        Ok(DiffOutcome {
            changed,
            next: StoredSnapshot {
                source_id: source.id.clone(),
                taken_at: snapshot.taken_at,
                records,
            },
            previous,
            cold_start,
            deferred: 0,
        })
    }

    /// Atomically replace the stored snapshot with the outcome's.
    pub async fn commit(&self, outcome: &DiffOutcome) -> Result<()> {
        self.store.save(&outcome.next).await
    }

    /// Compare and commit in one step.
    pub async fn diff(&self, source: &SourceConfig, snapshot: &Snapshot) -> Result<Vec<ChangedItem>> {
        let outcome = self.compare(source, snapshot).await?;
        self.commit(&outcome).await?;
        Ok(outcome.changed)
    }
}
