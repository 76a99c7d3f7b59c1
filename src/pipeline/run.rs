// src/pipeline/run.rs

//! One source run: fetch, diff, dedup, notify, commit.
//!
//! The stored snapshot is committed last so that a crash between the diff
//! and the sends reports the same items again on the next run. Items whose
//! dedup check fails are rewound in the outcome before the commit.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::Semaphore;

use crate::clock::Clock;
use crate::models::{ChangedItem, SourceConfig};
use crate::pipeline::diff::ChangeDetector;
use crate::resilience::{BackoffPolicy, CircuitState, ExecuteError, ResilienceController};
use crate::services::{
    FetchError, Fetcher, Notifier, SEND_ATTEMPTS, format_alert, send_with_retry,
};
use crate::storage::DedupStore;

/// Shared dependencies of every run.
pub struct RunContext {
    pub controller: ResilienceController,
    pub detector: ChangeDetector,
    pub dedup: Arc<dyn DedupStore>,
    pub notifier: Arc<dyn Notifier>,
    pub limiter: Arc<Semaphore>,
    pub clock: Arc<dyn Clock>,
    send_policy: BackoffPolicy,
}

impl RunContext {
    pub fn new(
        controller: ResilienceController,
        detector: ChangeDetector,
        dedup: Arc<dyn DedupStore>,
        notifier: Arc<dyn Notifier>,
        limiter: Arc<Semaphore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let send_policy = controller.backoff().clone().with_max_attempts(SEND_ATTEMPTS);
        Self {
            controller,
            detector,
            dedup,
            notifier,
            limiter,
            clock,
            send_policy,
        }
    }

    /// Send `text` to `target` with the bounded send policy.
    pub async fn send(&self, target: &str, text: &str) -> bool {
        match send_with_retry(self.notifier.as_ref(), &self.send_policy, target, text).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Message to {} not delivered: {}", target, e);
                false
            }
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Snapshot fetched and stored
    Updated { changes: usize },
    /// Fetch or storage failed
    Failed { attempts: u32, error: String },
    /// Skipped because the circuit is open
    CircuitOpen { retry_in: Duration },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

/// Everything the scheduler and the statistics need from one run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub source_id: String,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Items reported by the diff
    pub changes: usize,
    /// Items that passed the dedup check
    pub notified: usize,
    /// Items suppressed by the dedup window
    pub suppressed: usize,
    /// Items rewound because the dedup store was unavailable
    pub deferred: usize,
    pub messages_sent: usize,
    pub send_failures: usize,
    /// This run opened the circuit
    pub tripped: bool,
}

impl RunReport {
    fn new(source_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.to_string(),
            outcome: RunOutcome::Failed {
                attempts: 0,
                error: String::new(),
            },
            started_at,
            finished_at: started_at,
            changes: 0,
            notified: 0,
            suppressed: 0,
            deferred: 0,
            messages_sent: 0,
            send_failures: 0,
            tripped: false,
        }
    }

    fn finish(mut self, outcome: RunOutcome, at: DateTime<Utc>) -> Self {
        self.outcome = outcome;
        self.finished_at = at;
        self
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Run one source under its circuit.
pub async fn run_source(
    ctx: &RunContext,
    source: &SourceConfig,
    fetcher: &dyn Fetcher,
    circuit: &mut CircuitState,
) -> RunReport {
    let mut report = RunReport::new(&source.id, ctx.clock.now());
    let trips_before = circuit.trips();

    let limiter = &ctx.limiter;
    let fetched = ctx
        .controller
        .execute(&source.id, circuit, move || async move {
            let _permit = limiter.acquire().await.map_err(|_| FetchError::Cancelled)?;
            fetcher.fetch().await
        })
        .await;

    report.tripped = circuit.trips() > trips_before;

    let snapshot = match fetched {
        Ok(snapshot) => snapshot,
        Err(ExecuteError::CircuitOpen { retry_in }) => {
            return report.finish(RunOutcome::CircuitOpen { retry_in }, ctx.clock.now());
        }
        Err(ExecuteError::ExhaustedRetries {
            attempts,
            last_error,
        }) => {
            let outcome = RunOutcome::Failed {
                attempts,
                error: last_error.to_string(),
            };
            return report.finish(outcome, ctx.clock.now());
        }
    };

    let mut outcome = match ctx.detector.compare(source, &snapshot).await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("[{}] cannot load stored snapshot: {}", source.id, e);
            let failed = RunOutcome::Failed {
                attempts: 1,
                error: e.to_string(),
            };
            return report.finish(failed, ctx.clock.now());
        }
    };
    report.changes = outcome.changed().len();

    let mut to_send: Vec<ChangedItem> = Vec::new();
    for changed in outcome.changed().to_vec() {
        match ctx.dedup.should_notify(&source.id, &changed.identity).await {
            Ok(true) => to_send.push(changed),
            Ok(false) => {
                log::debug!("[{}] suppressed duplicate: {}", source.id, changed.item.name);
                report.suppressed += 1;
            }
            Err(e) => {
                log::warn!(
                    "[{}] dedup unavailable, deferring {}: {}",
                    source.id,
                    changed.item.name,
                    e
                );
                outcome.defer(&changed.identity);
                report.deferred += 1;
            }
        }
    }
    report.notified = to_send.len();

    if !to_send.is_empty() {
        if source.notify.is_empty() {
            log::info!(
                "[{}] {} new/changed item(s), no notify targets",
                source.id,
                to_send.len()
            );
        } else {
            let text = format_alert(source, &to_send);
            for target in &source.notify {
                if ctx.send(target, &text).await {
                    report.messages_sent += 1;
                } else {
                    report.send_failures += 1;
                }
            }
        }
    }

    if let Err(e) = ctx.detector.commit(&outcome).await {
        log::error!("[{}] cannot store snapshot: {}", source.id, e);
        let failed = RunOutcome::Failed {
            attempts: 1,
            error: e.to_string(),
        };
        return report.finish(failed, ctx.clock.now());
    }

    if report.changes > 0 {
        log::info!(
            "{} {} change(s): {} notified, {} suppressed, {} deferred",
            source.label(),
            report.changes,
            report.notified,
            report.suppressed,
            report.deferred
        );
    }
    let changes = report.changes;
    report.finish(RunOutcome::Updated { changes }, ctx.clock.now())
}

/// Owned form of [`run_source`] for spawned tasks.
///
/// The circuit travels with the run and comes back with its report. A panic
/// inside the run is reported as a failure and the source gets a fresh
/// circuit.
pub async fn run_detached(
    ctx: Arc<RunContext>,
    source: Arc<SourceConfig>,
    fetcher: Arc<dyn Fetcher>,
    mut circuit: CircuitState,
) -> (RunReport, CircuitState) {
    let started_at = ctx.clock.now();
    let result = AssertUnwindSafe(run_source(&ctx, &source, fetcher.as_ref(), &mut circuit))
        .catch_unwind()
        .await;

    match result {
        Ok(report) => (report, circuit),
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            log::error!("{} run panicked: {}", source.label(), message);
            let report = RunReport::new(&source.id, started_at).finish(
                RunOutcome::Failed {
                    attempts: 1,
                    error: format!("panic: {message}"),
                },
                ctx.clock.now(),
            );
            (report, ctx.controller.new_circuit())
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{
        CommandSpec, FetchSpec, Item, ResilienceConfig, Snapshot, Tier,
    };
    use crate::pipeline::normalize::Normalizer;
    use crate::resilience::CircuitStatus;
    use crate::services::SendError;
    use crate::storage::{DedupError, LocalSnapshotStore, SnapshotStore, SqliteDedupStore};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::{TempDir, tempdir};

    struct StaticFetcher {
        clock: ManualClock,
        items: Mutex<Vec<Item>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self) -> std::result::Result<Snapshot, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let items = self.items.lock().unwrap().clone();
            if items.is_empty() {
                return Err(FetchError::Empty);
            }
            Ok(Snapshot::new(self.clock.now(), items))
        }
    }

    struct PanickingFetcher;

    #[async_trait]
    impl Fetcher for PanickingFetcher {
        async fn fetch(&self) -> std::result::Result<Snapshot, FetchError> {
            panic!("scraper exploded")
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, target: &str, text: &str) -> std::result::Result<(), SendError> {
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), text.to_string()));
            Ok(())
        }
    }

    struct BrokenDedup;

    #[async_trait]
    impl DedupStore for BrokenDedup {
        async fn should_notify(
            &self,
            _source_id: &str,
            _item_hash: &str,
        ) -> std::result::Result<bool, DedupError> {
            Err(DedupError::Worker("store offline".into()))
        }

        async fn prune(&self, _retention: chrono::Duration) -> std::result::Result<usize, DedupError> {
            Ok(0)
        }

        async fn count(&self) -> std::result::Result<u64, DedupError> {
            Ok(0)
        }
    }

    struct Harness {
        ctx: RunContext,
        clock: ManualClock,
        notifier: Arc<RecordingNotifier>,
        store: Arc<LocalSnapshotStore>,
        _dir: TempDir,
    }

    fn harness(dedup: Option<Arc<dyn DedupStore>>) -> Harness {
        let dir = tempdir().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(LocalSnapshotStore::open(dir.path().join("snapshots")).unwrap());
        let dedup = dedup.unwrap_or_else(|| -> Arc<dyn DedupStore> {
            Arc::new(
                SqliteDedupStore::open(
                    dir.path().join("notifications.db"),
                    chrono::Duration::hours(6),
                    shared.clone(),
                )
                .unwrap(),
            )
        });
        let notifier = Arc::new(RecordingNotifier::default());
        let config = ResilienceConfig {
            max_attempts: 2,
            ..ResilienceConfig::default()
        };
        let ctx = RunContext::new(
            ResilienceController::new(&config, shared.clone()),
            ChangeDetector::new(store.clone(), Arc::new(Normalizer::new())),
            dedup,
            notifier.clone(),
            Arc::new(Semaphore::new(2)),
            shared,
        );
        Harness {
            ctx,
            clock,
            notifier,
            store,
            _dir: dir,
        }
    }

    fn source() -> SourceConfig {
        SourceConfig {
            id: "hatosya".into(),
            name: "Hatosya".into(),
            category: "cameras".into(),
            tier: Tier::P1,
            active: true,
            url: None,
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

    fn fetcher(clock: &ManualClock, items: Vec<Item>) -> StaticFetcher {
        StaticFetcher {
            clock: clock.clone(),
            items: Mutex::new(items),
            calls: AtomicU32::new(0),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_notifies_and_commits() {
        let h = harness(None);
        let mut circuit = h.ctx.controller.new_circuit();
        let f = fetcher(
            &h.clock,
            vec![
                Item::named("Leica M6").with_price(250_000),
                Item::named("Nikon F3").with_price(60_000),
            ],
        );

        let report = run_source(&h.ctx, &source(), &f, &mut circuit).await;
        assert_eq!(report.outcome, RunOutcome::Updated { changes: 2 });
        assert_eq!(report.notified, 2);
        assert_eq!(report.messages_sent, 1);

        let sent = h.notifier.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "room-1");
        assert!(sent[0].1.contains("Leica M6・250,000円"));

        let stored = h.store.load("hatosya").await.unwrap().unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_second_run_is_quiet() {
        let h = harness(None);
        let mut circuit = h.ctx.controller.new_circuit();
        let f = fetcher(&h.clock, vec![Item::named("Leica M6").with_price(250_000)]);

        run_source(&h.ctx, &source(), &f, &mut circuit).await;
        h.clock.advance(chrono::Duration::minutes(1));
        let report = run_source(&h.ctx, &source(), &f, &mut circuit).await;

        assert_eq!(report.outcome, RunOutcome::Updated { changes: 0 });
        assert_eq!(h.notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_price_change_inside_window_is_suppressed() {
        let h = harness(None);
        let mut circuit = h.ctx.controller.new_circuit();
        let f = fetcher(&h.clock, vec![Item::named("Leica M6").with_price(250_000)]);
        run_source(&h.ctx, &source(), &f, &mut circuit).await;

        *f.items.lock().unwrap() = vec![Item::named("Leica M6").with_price(230_000)];
        h.clock.advance(chrono::Duration::hours(1));
        let report = run_source(&h.ctx, &source(), &f, &mut circuit).await;

        assert_eq!(report.changes, 1);
        assert_eq!(report.suppressed, 1);
        assert_eq!(report.messages_sent, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_counts_against_circuit() {
        let h = harness(None);
        let mut circuit = h.ctx.controller.new_circuit();
        let f = fetcher(&h.clock, vec![]);

        let report = run_source(&h.ctx, &source(), &f, &mut circuit).await;
        assert!(matches!(
            report.outcome,
            RunOutcome::Failed { attempts: 2, .. }
        ));
        assert_eq!(f.calls.load(Ordering::SeqCst), 2);
        assert_eq!(circuit.failures(), 1);
        assert!(!report.tripped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trip_is_reported_once() {
        let h = harness(None);
        let mut circuit = h.ctx.controller.new_circuit();
        let f = fetcher(&h.clock, vec![]);

        let mut trips = 0;
        for _ in 0..6 {
            let report = run_source(&h.ctx, &source(), &f, &mut circuit).await;
            if report.tripped {
                trips += 1;
            }
        }
        assert_eq!(trips, 1);
        assert_eq!(circuit.status(), CircuitStatus::Open);
        assert_eq!(f.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_dedup_defers_items() {
        let h = harness(Some(Arc::new(BrokenDedup)));
        let mut circuit = h.ctx.controller.new_circuit();
        let f = fetcher(&h.clock, vec![Item::named("Leica M6").with_price(250_000)]);

        let report = run_source(&h.ctx, &source(), &f, &mut circuit).await;
        assert!(report.outcome.is_success());
        assert_eq!(report.deferred, 1);
        assert_eq!(report.notified, 0);
        assert!(h.notifier.sent.lock().unwrap().is_empty());

        let stored = h.store.load("hatosya").await.unwrap().unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panic_becomes_failure_with_fresh_circuit() {
        let h = harness(None);
        let ctx = Arc::new(h.ctx);
        let (report, circuit) = run_detached(
            ctx,
            Arc::new(source()),
            Arc::new(PanickingFetcher),
            CircuitState::new(5, chrono::Duration::seconds(300)),
        )
        .await;
        match report.outcome {
            RunOutcome::Failed { error, .. } => assert!(error.contains("scraper exploded")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(circuit.status(), CircuitStatus::Closed);
        assert_eq!(circuit.failures(), 0);
    }
}
