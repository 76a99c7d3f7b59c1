//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use shopwatch::clock::{Clock, ManualClock};
use shopwatch::models::{CommandSpec, Config, FetchSpec, Item, Snapshot, SourceConfig, Tier};
use shopwatch::pipeline::{ChangeDetector, Normalizer, RunContext};
use shopwatch::resilience::ResilienceController;
use shopwatch::services::{FetchError, Fetcher, Notifier, SendError};
use shopwatch::storage::{LocalSnapshotStore, SqliteDedupStore};
use tempfile::TempDir;
use tokio::sync::Semaphore;

/// Fetcher returning a scripted item list, or failing on demand.
pub struct ScriptedFetcher {
    clock: ManualClock,
    pub items: Mutex<Vec<Item>>,
    pub failing: AtomicBool,
    pub delay: Option<Duration>,
    pub calls: AtomicU32,
}

impl ScriptedFetcher {
    pub fn new(clock: &ManualClock, items: Vec<Item>) -> Self {
        Self {
            clock: clock.clone(),
            items: Mutex::new(items),
            failing: AtomicBool::new(false),
            delay: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_items(&self, items: Vec<Item>) {
        *self.items.lock().unwrap() = items;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(FetchError::Command("exit status: 1".into()));
        }
        let items = self.items.lock().unwrap().clone();
        Ok(Snapshot::new(self.clock.now(), items))
    }
}

/// Notifier that keeps every message.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, target: &str, text: &str) -> Result<(), SendError> {
        self.sent
            .lock()
            .unwrap()
            .push((target.to_string(), text.to_string()));
        Ok(())
    }
}

pub struct World {
    pub clock: ManualClock,
    pub config: Config,
    pub ctx: Arc<RunContext>,
    pub notifier: Arc<RecordingNotifier>,
    pub dir: TempDir,
}

pub fn world(adjust: impl FnOnce(&mut Config)) -> World {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
    clock.set_local_hour(12);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());

    let mut config = Config::default();
    config.paths.snapshot_dir = dir.path().join("snapshots");
    config.paths.dedup_db = dir.path().join("notifications.db");
    adjust(&mut config);

    let notifier = Arc::new(RecordingNotifier::default());
    let ctx = RunContext::new(
        ResilienceController::new(&config.resilience, shared.clone()),
        ChangeDetector::new(
            Arc::new(LocalSnapshotStore::open(&config.paths.snapshot_dir).unwrap()),
            Arc::new(Normalizer::new()),
        ),
        Arc::new(
            SqliteDedupStore::open(&config.paths.dedup_db, config.dedup.window(), shared.clone())
                .unwrap(),
        ),
        notifier.clone(),
        Arc::new(Semaphore::new(config.engine.max_workers)),
        shared,
    );

    World {
        clock,
        config,
        ctx: Arc::new(ctx),
        notifier,
        dir,
    }
}

pub fn source(id: &str, tier: Tier) -> SourceConfig {
    SourceConfig {
        id: id.into(),
        name: format!("Shop {id}"),
        category: "cameras".into(),
        tier,
        active: true,
        url: Some(format!("https://{id}.example.com/new")),
        notify: vec!["room-1".into()],
        fetch: FetchSpec::Command(CommandSpec {
            program: "true".into(),
            args: vec![],
            workdir: None,
            timeout_secs: None,
            url_index: None,
        }),
    }
}
