// src/app.rs

//! Wiring: builds every component from a [`Config`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::{Config, SourceConfig, Tier};
use crate::pipeline::{ChangeDetector, Normalizer, RunContext, RunReport, run_source};
use crate::resilience::ResilienceController;
use crate::scheduler::Scheduler;
use crate::services::{Fetcher, build_fetcher, build_notifier};
use crate::storage::{DedupStore, LocalSnapshotStore, SnapshotStore, SqliteDedupStore};
use crate::utils::http::create_client;

/// Stored state of one source, for the `status` command.
#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub id: String,
    pub tier: Tier,
    pub active: bool,
    pub taken_at: Option<DateTime<Utc>>,
    pub items: usize,
}

/// Fully wired application.
pub struct App {
    config: Config,
    ctx: Arc<RunContext>,
    sources: Vec<(SourceConfig, Arc<dyn Fetcher>)>,
    snapshots: Arc<LocalSnapshotStore>,
}

impl App {
    /// Validate `config`, open persistence and build every collaborator.
    ///
    /// Fails on invalid configuration, unreachable persistence or a missing
    /// notifier secret.
    pub fn build(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let client = create_client(&config.http)?;
        let snapshots = Arc::new(LocalSnapshotStore::open(&config.paths.snapshot_dir)?);
        let dedup = SqliteDedupStore::open(
            &config.paths.dedup_db,
            config.dedup.window(),
            clock.clone(),
        )?;
        let notifier = build_notifier(&config.notify, &client)?;
        let controller = ResilienceController::new(&config.resilience, clock.clone());
        let detector = ChangeDetector::new(snapshots.clone(), Arc::new(Normalizer::new()));

        let default_timeout = std::time::Duration::from_secs(config.engine.scraper_timeout_secs);
        let sources = config
            .active_sources()
            .map(|source| {
                let fetcher = build_fetcher(&source.fetch, &client, clock.clone(), default_timeout)?;
                Ok((source.clone(), fetcher))
            })
            .collect::<Result<Vec<_>>>()?;

        let ctx = RunContext::new(
            controller,
            detector,
            Arc::new(dedup),
            notifier,
            Arc::new(Semaphore::new(config.engine.max_workers)),
            clock,
        );

        Ok(Self {
            config,
            ctx: Arc::new(ctx),
            sources,
            snapshots,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Scheduler over every active source.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(&self.config, self.ctx.clone(), self.sources.clone())
    }

    /// Run every active source once, one after another.
    pub async fn run_once(&self) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(self.sources.len());
        for (source, fetcher) in &self.sources {
            let mut circuit = self.ctx.controller.new_circuit();
            log::info!("[{}] running once", source.id);
            reports.push(run_source(&self.ctx, source, fetcher.as_ref(), &mut circuit).await);
        }
        reports
    }

    /// Stored snapshot age and size of every configured source.
    pub async fn status(&self) -> Result<Vec<SourceStatus>> {
        let mut out = Vec::with_capacity(self.config.sources.len());
        for source in &self.config.sources {
            let stored = self.snapshots.load(&source.id).await?;
            out.push(SourceStatus {
                id: source.id.clone(),
                tier: source.tier,
                active: source.active,
                taken_at: stored.as_ref().map(|s| s.taken_at),
                items: stored.as_ref().map_or(0, |s| s.len()),
            });
        }
        Ok(out)
    }

    /// Number of notification records kept.
    pub async fn dedup_count(&self) -> Result<u64> {
        self.ctx
            .dedup
            .count()
            .await
            .map_err(|e| AppError::storage("dedup count", e))
    }

    /// Delete notification records older than the retention period.
    pub async fn prune(&self) -> Result<usize> {
        self.ctx
            .dedup
            .prune(self.config.dedup.retention())
            .await
            .map_err(|e| AppError::storage("dedup prune", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::{CommandSpec, FetchSpec};
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.paths.snapshot_dir = dir.join("snapshots");
        config.paths.dedup_db = dir.join("notifications.db");
        config.sources = vec![SourceConfig {
            id: "shop".into(),
            name: "Shop".into(),
            category: "cameras".into(),
            tier: Tier::P1,
            active: true,
            url: None,
            notify: vec![],
            fetch: FetchSpec::Command(CommandSpec {
                program: "true".into(),
                args: vec![],
                workdir: None,
                timeout_secs: None,
                url_index: None,
            }),
        }];
        config
    }

    #[tokio::test]
    async fn test_build_and_status() {
        let dir = tempdir().unwrap();
        let app = App::build(config(dir.path()), Arc::new(SystemClock)).unwrap();
        let status = app.status().await.unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].taken_at, None);
        assert_eq!(app.dedup_count().await.unwrap(), 0);
        assert_eq!(app.prune().await.unwrap(), 0);
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.engine.max_workers = 0;
        assert!(App::build(config, Arc::new(SystemClock)).is_err());
    }
}
