// src/models/config.rs

//! Application configuration structures.

use std::collections::HashSet;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::source::{FetchSpec, SourceConfig, Tier};

/// Hard bounds of the P1 interval in seconds.
pub const P1_INTERVAL_BOUNDS: RangeInclusive<u64> = 60..=3600;

/// Longest period any setting may name (one year).
pub const MAX_PERIOD_SECS: u64 = 365 * 24 * 3600;

/// `secs` as a chrono duration, capped at [`MAX_PERIOD_SECS`].
pub fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_PERIOD_SECS) as i64)
}

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool, tick and report settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// P1/P2 cadence settings
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Circuit breaker and backoff settings
    #[serde(default)]
    pub resilience: ResilienceConfig,

    /// Notification dedup window
    #[serde(default)]
    pub dedup: DedupConfig,

    /// On-disk locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// HTTP client settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Notification transport
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Monitored sources
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Config {
    /// Load configuration from a TOML file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| AppError::config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `SCRAPER_TIMEOUT` and `HTTP_TIMEOUT` from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secs) = lookup("SCRAPER_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.engine.scraper_timeout_secs = secs;
        }
        if let Some(secs) = lookup("HTTP_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.http.timeout_secs = secs;
        }
    }

    /// Sources that should be scheduled.
    pub fn active_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.active)
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_workers == 0 {
            return Err(AppError::validation("engine.max_workers must be > 0"));
        }
        if self.engine.tick_secs == 0 {
            return Err(AppError::validation("engine.tick_secs must be > 0"));
        }
        if self.engine.report_interval_secs == 0 {
            return Err(AppError::validation(
                "engine.report_interval_secs must be > 0",
            ));
        }
        if self.engine.scraper_timeout_secs == 0 {
            return Err(AppError::validation(
                "engine.scraper_timeout_secs must be > 0",
            ));
        }

        self.validate_periods()?;

        let s = &self.schedule;
        if !P1_INTERVAL_BOUNDS.contains(&s.p1_min_secs)
            || !P1_INTERVAL_BOUNDS.contains(&s.p1_max_secs)
            || s.p1_min_secs > s.p1_max_secs
        {
            return Err(AppError::validation(
                "schedule.p1_min_secs and p1_max_secs must lie in 60..=3600 with min <= max",
            ));
        }
        if s.p2_cycle_secs == 0 || s.night_interval_secs == 0 {
            return Err(AppError::validation(
                "schedule.p2_cycle_secs and night_interval_secs must be > 0",
            ));
        }
        if s.night_start_hour > 23 || s.night_end_hour > 23 {
            return Err(AppError::validation(
                "schedule.night_start_hour and night_end_hour must be in 0..=23",
            ));
        }

        let r = &self.resilience;
        if r.failure_threshold == 0 || r.max_attempts == 0 {
            return Err(AppError::validation(
                "resilience.failure_threshold and max_attempts must be > 0",
            ));
        }
        if Duration::from_millis(r.base_delay_ms) > Duration::from_secs(r.max_delay_secs) {
            return Err(AppError::validation(
                "resilience.base_delay_ms must not exceed max_delay_secs",
            ));
        }

        if self.dedup.window_secs == 0 {
            return Err(AppError::validation("dedup.window_secs must be > 0"));
        }
        if self.dedup.retention_secs < self.dedup.window_secs {
            return Err(AppError::validation(
                "dedup.retention_secs must be >= window_secs",
            ));
        }
        if self.http.user_agent.trim().is_empty() {
            return Err(AppError::validation("http.user_agent is empty"));
        }
        if self.http.timeout_secs == 0 {
            return Err(AppError::validation("http.timeout_secs must be > 0"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if !SourceConfig::is_valid_id(&source.id) {
                return Err(AppError::validation(format!(
                    "source id {:?} must be non-empty and use only [A-Za-z0-9_.-]",
                    source.id
                )));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(AppError::validation(format!(
                    "duplicate source id {:?}",
                    source.id
                )));
            }
            validate_fetch(&source.id, &source.fetch)?;
        }
        Ok(())
    }

    fn validate_periods(&self) -> Result<()> {
        let periods = [
            ("engine.tick_secs", self.engine.tick_secs),
            ("engine.report_interval_secs", self.engine.report_interval_secs),
            ("engine.shutdown_grace_secs", self.engine.shutdown_grace_secs),
            ("engine.scraper_timeout_secs", self.engine.scraper_timeout_secs),
            ("schedule.p2_cycle_secs", self.schedule.p2_cycle_secs),
            ("schedule.night_interval_secs", self.schedule.night_interval_secs),
            ("schedule.p1_stale_secs", self.schedule.p1_stale_secs),
            ("schedule.p2_stale_secs", self.schedule.p2_stale_secs),
            ("resilience.cooldown_secs", self.resilience.cooldown_secs),
            ("resilience.max_delay_secs", self.resilience.max_delay_secs),
            ("dedup.window_secs", self.dedup.window_secs),
            ("dedup.retention_secs", self.dedup.retention_secs),
            ("http.timeout_secs", self.http.timeout_secs),
        ];
        match periods.iter().find(|(_, secs)| *secs > MAX_PERIOD_SECS) {
            Some((name, secs)) => Err(AppError::validation(format!(
                "{name} = {secs} exceeds {MAX_PERIOD_SECS}"
            ))),
            None => Ok(()),
        }
    }

    /// Number of active sources per tier, for startup logging.
    pub fn tier_counts(&self) -> (usize, usize) {
        self.active_sources().fold((0, 0), |(p1, p2), s| match s.tier {
            Tier::P1 => (p1 + 1, p2),
            Tier::P2 => (p1, p2 + 1),
        })
    }
}

fn validate_fetch(id: &str, fetch: &FetchSpec) -> Result<()> {
    match fetch {
        FetchSpec::Command(spec) => {
            if spec.program.trim().is_empty() {
                return Err(AppError::validation(format!(
                    "source {id}: command program is empty"
                )));
            }
        }
        FetchSpec::Html(spec) => {
            url::Url::parse(&spec.url).map_err(|e| {
                AppError::validation(format!("source {id}: invalid url {:?}: {e}", spec.url))
            })?;
            let selectors = [Some(&spec.item), Some(&spec.name)]
                .into_iter()
                .chain([
                    spec.price.as_ref(),
                    spec.status.as_ref(),
                    spec.image.as_ref(),
                    spec.link.as_ref(),
                ])
                .flatten();
            for selector in selectors {
                scraper::Selector::parse(selector).map_err(|e| {
                    AppError::validation(format!(
                        "source {id}: invalid selector {selector:?}: {e:?}"
                    ))
                })?;
            }
        }
    }
    Ok(())
}

/// Worker pool and control loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent fetch attempts
    #[serde(default = "defaults::max_workers")]
    pub max_workers: usize,

    /// Control loop tick in seconds
    #[serde(default = "defaults::tick")]
    pub tick_secs: u64,

    /// Seconds between statistics reports
    #[serde(default = "defaults::report_interval")]
    pub report_interval_secs: u64,

    /// Seconds to wait for in-flight runs on shutdown
    #[serde(default = "defaults::shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Default timeout for external scraper commands
    #[serde(default = "defaults::scraper_timeout")]
    pub scraper_timeout_secs: u64,
}

impl EngineConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: defaults::max_workers(),
            tick_secs: defaults::tick(),
            report_interval_secs: defaults::report_interval(),
            shutdown_grace_secs: defaults::shutdown_grace(),
            scraper_timeout_secs: defaults::scraper_timeout(),
        }
    }
}

/// P1/P2 cadence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Lower bound of the P1 interval
    #[serde(default = "defaults::p1_min")]
    pub p1_min_secs: u64,

    /// Upper bound of the P1 interval
    #[serde(default = "defaults::p1_max")]
    pub p1_max_secs: u64,

    /// Target length of one P2 cycle
    #[serde(default = "defaults::p2_cycle")]
    pub p2_cycle_secs: u64,

    /// First local hour of the night window (inclusive)
    #[serde(default = "defaults::night_start")]
    pub night_start_hour: u32,

    /// Local hour the night window ends (exclusive)
    #[serde(default = "defaults::night_end")]
    pub night_end_hour: u32,

    /// Interval used by both tiers during the night window
    #[serde(default = "defaults::night_interval")]
    pub night_interval_secs: u64,

    /// Staleness threshold for P1 sources
    #[serde(default = "defaults::stale")]
    pub p1_stale_secs: u64,

    /// Staleness threshold for P2 sources
    #[serde(default = "defaults::stale")]
    pub p2_stale_secs: u64,
}

impl ScheduleConfig {
    /// Staleness threshold for the given tier.
    pub fn stale_after(&self, tier: Tier) -> chrono::Duration {
        let secs = match tier {
            Tier::P1 => self.p1_stale_secs,
            Tier::P2 => self.p2_stale_secs,
        };
        seconds(secs)
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            p1_min_secs: defaults::p1_min(),
            p1_max_secs: defaults::p1_max(),
            p2_cycle_secs: defaults::p2_cycle(),
            night_start_hour: defaults::night_start(),
            night_end_hour: defaults::night_end(),
            night_interval_secs: defaults::night_interval(),
            p1_stale_secs: defaults::stale(),
            p2_stale_secs: defaults::stale(),
        }
    }
}

/// Circuit breaker and backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "defaults::failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit waits before a trial
    #[serde(default = "defaults::cooldown")]
    pub cooldown_secs: u64,

    /// First backoff delay in milliseconds
    #[serde(default = "defaults::base_delay")]
    pub base_delay_ms: u64,

    /// Backoff ceiling in seconds
    #[serde(default = "defaults::max_delay")]
    pub max_delay_secs: u64,

    /// Attempts per execution
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: defaults::failure_threshold(),
            cooldown_secs: defaults::cooldown(),
            base_delay_ms: defaults::base_delay(),
            max_delay_secs: defaults::max_delay(),
            max_attempts: defaults::max_attempts(),
        }
    }
}

/// Notification dedup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Suppression window in seconds
    #[serde(default = "defaults::dedup_window")]
    pub window_secs: u64,

    /// Age after which records are garbage collected
    #[serde(default = "defaults::dedup_retention")]
    pub retention_secs: u64,
}

impl DedupConfig {
    pub fn window(&self) -> chrono::Duration {
        seconds(self.window_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        seconds(self.retention_secs)
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: defaults::dedup_window(),
            retention_secs: defaults::dedup_retention(),
        }
    }
}

/// On-disk locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one snapshot file per source
    #[serde(default = "defaults::snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// SQLite database for notification history
    #[serde(default = "defaults::dedup_db")]
    pub dedup_db: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: defaults::snapshot_dir(),
            dedup_db: defaults::dedup_db(),
        }
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::http_timeout")]
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::http_timeout(),
        }
    }
}

/// Notification transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    /// ChatWork rooms API
    Chatwork,
    /// Write alerts to the log only
    #[default]
    Log,
}

/// Notification transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub kind: NotifyKind,

    /// API root for the chat service
    #[serde(default = "defaults::chatwork_base_url")]
    pub base_url: String,

    /// Room receiving statistics reports
    #[serde(default)]
    pub admin_target: Option<String>,

    /// Environment variable holding the API token
    #[serde(default = "defaults::token_env")]
    pub token_env: String,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            kind: NotifyKind::default(),
            base_url: defaults::chatwork_base_url(),
            admin_target: None,
            token_env: defaults::token_env(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;

    // Engine defaults
    pub fn max_workers() -> usize {
        3
    }
    pub fn tick() -> u64 {
        5
    }
    pub fn report_interval() -> u64 {
        3600
    }
    pub fn shutdown_grace() -> u64 {
        30
    }
    pub fn scraper_timeout() -> u64 {
        120
    }

    // Schedule defaults
    pub fn p1_min() -> u64 {
        60
    }
    pub fn p1_max() -> u64 {
        3600
    }
    pub fn p2_cycle() -> u64 {
        300
    }
    pub fn night_start() -> u32 {
        1
    }
    pub fn night_end() -> u32 {
        8
    }
    pub fn night_interval() -> u64 {
        1800
    }
    pub fn stale() -> u64 {
        7200
    }

    // Resilience defaults
    pub fn failure_threshold() -> u32 {
        5
    }
    pub fn cooldown() -> u64 {
        300
    }
    pub fn base_delay() -> u64 {
        50
    }
    pub fn max_delay() -> u64 {
        300
    }
    pub fn max_attempts() -> u32 {
        10
    }

    // Dedup defaults
    pub fn dedup_window() -> u64 {
        6 * 3600
    }
    pub fn dedup_retention() -> u64 {
        24 * 3600
    }

    // Path defaults
    pub fn snapshot_dir() -> PathBuf {
        PathBuf::from("data/snapshots")
    }
    pub fn dedup_db() -> PathBuf {
        PathBuf::from("data/notifications.db")
    }

    // HTTP defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; shopwatch/0.1)".into()
    }
    pub fn http_timeout() -> u64 {
        30
    }

    // Notify defaults
    pub fn chatwork_base_url() -> String {
        "https://api.chatwork.com/v2".into()
    }
    pub fn token_env() -> String {
        "CHATWORK_TOKEN".into()
    }
}
