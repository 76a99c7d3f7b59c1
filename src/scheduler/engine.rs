// src/scheduler/engine.rs

//! Control loop: tick, dispatch due sources, collect finished runs.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::models::{Config, ScheduleConfig, SourceConfig, Tier, seconds};
use crate::pipeline::{
    RunContext, RunReport, RunStats, SourceHealth, format_report, run_detached, stale_sources,
};
use crate::resilience::CircuitState;
use crate::scheduler::p2::P2Cycle;
use crate::scheduler::state::{P1Policy, ScheduleState, dispatch_order};
use crate::services::Fetcher;

struct Entry {
    source: Arc<SourceConfig>,
    fetcher: Arc<dyn Fetcher>,
    state: ScheduleState,
    /// `None` while the circuit travels with an in-flight run
    circuit: Option<CircuitState>,
}

impl Entry {
    fn is_failing(&self) -> bool {
        self.state.consecutive_failures > 0
            || self.circuit.as_ref().is_some_and(CircuitState::is_failing)
    }
}

/// Dual-tier scheduler owning the per-source registry.
pub struct Scheduler {
    ctx: Arc<RunContext>,
    schedule: ScheduleConfig,
    policy: P1Policy,
    tick: StdDuration,
    report_interval: Duration,
    retention: Duration,
    shutdown_grace: StdDuration,
    admin_target: Option<String>,
    entries: BTreeMap<String, Entry>,
    p2: P2Cycle,
    stats: RunStats,
    started_at: DateTime<Utc>,
    last_report: DateTime<Utc>,
    tasks: JoinSet<(RunReport, CircuitState)>,
}

impl Scheduler {
    pub fn new(
        config: &Config,
        ctx: Arc<RunContext>,
        sources: Vec<(SourceConfig, Arc<dyn Fetcher>)>,
    ) -> Self {
        let now = ctx.clock.now();
        let policy = P1Policy::from_config(&config.schedule);
        let entries = sources
            .into_iter()
            .map(|(source, fetcher)| {
                let mut state = ScheduleState::new(source.id.clone(), source.tier, now, policy.min);
                if source.tier == Tier::P2 {
                    state.next_due = DateTime::<Utc>::MAX_UTC;
                }
                let entry = Entry {
                    source: Arc::new(source),
                    fetcher,
                    state,
                    circuit: Some(ctx.controller.new_circuit()),
                };
                (entry.source.id.clone(), entry)
            })
            .collect();

        Self {
            schedule: config.schedule.clone(),
            policy,
            tick: config.engine.tick(),
            report_interval: seconds(config.engine.report_interval_secs),
            retention: config.dedup.retention(),
            shutdown_grace: config.engine.shutdown_grace(),
            admin_target: config.notify.admin_target.clone(),
            entries,
            p2: P2Cycle::new(&config.schedule, now),
            stats: RunStats::default(),
            started_at: now,
            last_report: now,
            tasks: JoinSet::new(),
            ctx,
        }
    }

    pub fn state(&self, source_id: &str) -> Option<&ScheduleState> {
        self.entries.get(source_id).map(|e| &e.state)
    }

    /// Parked circuit of a source, `None` while it is running.
    pub fn circuit(&self, source_id: &str) -> Option<&CircuitState> {
        self.entries.get(source_id).and_then(|e| e.circuit.as_ref())
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn p2(&self) -> &P2Cycle {
        &self.p2
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Seed `last_success` from the stored snapshots.
    pub async fn seed_from_store(&mut self) {
        for entry in self.entries.values_mut() {
            match self.ctx.detector.store().load(&entry.source.id).await {
                Ok(Some(snapshot)) => entry.state.last_success = Some(snapshot.taken_at),
                Ok(None) => {}
                Err(e) => log::warn!("[{}] cannot read stored snapshot: {}", entry.source.id, e),
            }
        }
    }

    /// One scheduling step: collect finished runs, report if due, start a P2
    /// cycle if due, dispatch everything that is due.
    pub async fn tick(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            self.on_joined(joined);
        }

        let now = self.ctx.clock.now();
        if now - self.last_report >= self.report_interval {
            self.emit_report(now).await;
        }
        self.start_p2_cycle(now);
        self.dispatch(now);
    }

    /// Wait for every in-flight run and apply its result.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            self.on_joined(joined);
        }
    }

    /// Run until `shutdown` resolves, then wait for in-flight runs up to the
    /// grace period and abort the rest.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        self.seed_from_store().await;
        let (p1, p2) = self
            .entries
            .values()
            .fold((0, 0), |(p1, p2), e| match e.source.tier {
                Tier::P1 => (p1 + 1, p2),
                Tier::P2 => (p1, p2 + 1),
            });
        log::info!("Scheduler started: {} P1 source(s), {} P2 source(s)", p1, p2);

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.tick().await,
                Some(joined) = self.tasks.join_next() => self.on_joined(joined),
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        if self.tasks.is_empty() {
            log::info!("Scheduler stopped");
            return;
        }
        log::info!(
            "Shutting down, waiting up to {}s for {} run(s)",
            self.shutdown_grace.as_secs(),
            self.tasks.len()
        );
        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);

        while !self.tasks.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    log::warn!("Grace period over, aborting {} run(s)", self.tasks.len());
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    break;
                }
                Some(joined) = self.tasks.join_next() => self.on_joined(joined),
            }
        }
        log::info!("Scheduler stopped");
    }

    fn start_p2_cycle(&mut self, now: DateTime<Utc>) {
        let candidates = self
            .entries
            .values()
            .filter(|e| e.source.tier == Tier::P2)
            .map(|e| e.source.id.clone());
        let queued = self.p2.try_start(candidates, now);
        if queued.is_empty() {
            return;
        }
        log::debug!("P2 cycle started with {} source(s)", queued.len());
        for id in queued {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state.next_due = now;
            }
        }
    }

    fn dispatch(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(&ScheduleState, bool)> = self
            .entries
            .values()
            .filter(|e| e.state.is_due(now) && e.circuit.is_some())
            .map(|e| (&e.state, e.is_failing()))
            .collect();
        due.sort_by(|a, b| dispatch_order(*a, *b));
        let ids: Vec<String> = due.into_iter().map(|(s, _)| s.source_id.clone()).collect();

        for id in ids {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            let Some(circuit) = entry.circuit.take() else {
                continue;
            };
            entry.state.in_flight = true;
            log::debug!("[{}] dispatching ({})", id, entry.source.tier);
            self.tasks.spawn(run_detached(
                self.ctx.clone(),
                entry.source.clone(),
                entry.fetcher.clone(),
                circuit,
            ));
        }
    }

    fn on_joined(&mut self, joined: Result<(RunReport, CircuitState), JoinError>) {
        match joined {
            Ok((report, circuit)) => self.complete(report, circuit),
            Err(e) if e.is_cancelled() => log::debug!("Run task cancelled"),
            Err(e) => log::error!("Run task failed: {}", e),
        }
    }

    fn complete(&mut self, report: RunReport, circuit: CircuitState) {
        self.stats.record(&report);
        let Some(entry) = self.entries.get_mut(&report.source_id) else {
            return;
        };
        entry.circuit = Some(circuit);

        let local_hour = self.ctx.clock.local_hour();
        match entry.source.tier {
            Tier::P1 => {
                entry.state.apply_p1(&report, &self.policy, local_hour);
                log::debug!(
                    "[{}] next run in {}s",
                    report.source_id,
                    (entry.state.next_due - report.finished_at).num_seconds()
                );
            }
            Tier::P2 => {
                entry.state.record(&report);
                entry.state.next_due = DateTime::<Utc>::MAX_UTC;
                if let Some(summary) =
                    self.p2
                        .finish(&report.source_id, report.finished_at, local_hour)
                {
                    log::info!(
                        "P2 cycle #{} done: {} source(s) in {}s, next at {}",
                        summary.number,
                        summary.sources,
                        summary.duration.num_seconds(),
                        summary.next_start.format("%H:%M:%S")
                    );
                }
            }
        }
    }

    async fn emit_report(&mut self, now: DateTime<Utc>) {
        let period = now - self.last_report;
        self.last_report = now;
        let stats = self.stats.take();

        let health: Vec<SourceHealth> = self
            .entries
            .values()
            .map(|e| SourceHealth {
                id: e.source.id.clone(),
                tier: e.source.tier,
                last_success: e.state.last_success,
            })
            .collect();
        let stale = stale_sources(&health, &self.schedule, self.started_at, now);
        let text = format_report(&stats, period, now, health.len(), &stale);

        match &self.admin_target {
            Some(target) => {
                if !self.ctx.send(target, &text).await {
                    log::warn!("Report not delivered");
                }
            }
            None => log::info!("{}", text),
        }

        match self.ctx.dedup.prune(self.retention).await {
            Ok(removed) => log::debug!("Dedup prune removed {} record(s)", removed),
            Err(e) => log::warn!("Dedup prune failed: {}", e),
        }
    }
}
