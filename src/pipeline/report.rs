// src/pipeline/report.rs

//! Periodic statistics report and staleness detection.

use std::fmt::Write as _;

use chrono::{DateTime, Duration, Local, Utc};

use crate::models::{ScheduleConfig, Tier};
use crate::pipeline::run::{RunOutcome, RunReport};

/// Counters accumulated between two reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub circuit_skips: u64,
    pub trips: u64,
    pub changes: u64,
    pub notified: u64,
    pub suppressed: u64,
    pub deferred: u64,
    pub messages_sent: u64,
    pub send_failures: u64,
}

impl RunStats {
    pub fn record(&mut self, report: &RunReport) {
        match report.outcome {
            RunOutcome::Updated { .. } => {
                self.runs += 1;
                self.successes += 1;
            }
            RunOutcome::Failed { .. } => {
                self.runs += 1;
                self.failures += 1;
            }
            RunOutcome::CircuitOpen { .. } => self.circuit_skips += 1,
        }
        if report.tripped {
            self.trips += 1;
        }
        self.changes += report.changes as u64;
        self.notified += report.notified as u64;
        self.suppressed += report.suppressed as u64;
        self.deferred += report.deferred as u64;
        self.messages_sent += report.messages_sent as u64;
        self.send_failures += report.send_failures as u64;
    }

    /// Current counters, resetting them to zero.
    pub fn take(&mut self) -> RunStats {
        std::mem::take(self)
    }
}

/// Freshness input for one source.
#[derive(Debug, Clone)]
pub struct SourceHealth {
    pub id: String,
    pub tier: Tier,
    pub last_success: Option<DateTime<Utc>>,
}

/// A source whose last successful update is too old.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleSource {
    pub id: String,
    pub tier: Tier,
    /// Time since the last success, or since startup when never updated
    pub age: Duration,
    pub never_updated: bool,
}

/// Sources older than their tier's threshold, oldest first.
///
/// A source that never succeeded counts as stale once the process has been
/// up longer than the threshold.
pub fn stale_sources(
    sources: &[SourceHealth],
    schedule: &ScheduleConfig,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<StaleSource> {
    let mut stale: Vec<StaleSource> = sources
        .iter()
        .filter_map(|health| {
            let threshold = schedule.stale_after(health.tier);
            let (age, never_updated) = match health.last_success {
                Some(at) => (now - at, false),
                None => (now - started_at, true),
            };
            (age > threshold).then(|| StaleSource {
                id: health.id.clone(),
                tier: health.tier,
                age,
                never_updated,
            })
        })
        .collect();
    stale.sort_by(|a, b| b.age.cmp(&a.age).then_with(|| a.id.cmp(&b.id)));
    stale
}

fn format_age(age: Duration) -> String {
    let minutes = age.num_minutes().max(0);
    if minutes >= 60 {
        format!("{}h {}m", minutes / 60, minutes % 60)
    } else {
        format!("{minutes}m")
    }
}

/// Text of the periodic report.
pub fn format_report(
    stats: &RunStats,
    period: Duration,
    now: DateTime<Utc>,
    total_sources: usize,
    stale: &[StaleSource],
) -> String {
    let mut text = String::new();
    let _ = writeln!(
        text,
        "📊 shopwatch report {}",
        now.with_timezone(&Local).format("%Y-%m-%d %H:%M")
    );
    let _ = writeln!(text, "period: {}", format_age(period));
    let _ = writeln!(
        text,
        "runs: {} (ok {}, failed {}), circuit skips: {}, circuit trips: {}",
        stats.runs, stats.successes, stats.failures, stats.circuit_skips, stats.trips
    );
    let _ = writeln!(
        text,
        "changes: {}, notified: {}, suppressed: {}, deferred: {}",
        stats.changes, stats.notified, stats.suppressed, stats.deferred
    );
    let _ = writeln!(
        text,
        "messages: {} sent, {} failed",
        stats.messages_sent, stats.send_failures
    );
    let _ = write!(
        text,
        "sources: {} fresh, {} stale",
        total_sources.saturating_sub(stale.len()),
        stale.len()
    );
    for source in stale {
        let age = if source.never_updated {
            format!("never updated ({} uptime)", format_age(source.age))
        } else {
            format_age(source.age)
        };
        let _ = write!(text, "\n⚠ {} [{}] {}", source.id, source.tier, age);
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn report(outcome: RunOutcome) -> RunReport {
        RunReport {
            source_id: "shop".into(),
            outcome,
            started_at: t0(),
            finished_at: t0(),
            changes: 2,
            notified: 1,
            suppressed: 1,
            deferred: 0,
            messages_sent: 1,
            send_failures: 0,
            tripped: false,
        }
    }

    #[test]
    fn test_record_and_take() {
        let mut stats = RunStats::default();
        stats.record(&report(RunOutcome::Updated { changes: 2 }));
        stats.record(&report(RunOutcome::CircuitOpen {
            retry_in: std::time::Duration::from_secs(10),
        }));
        let mut failed = report(RunOutcome::Failed {
            attempts: 10,
            error: "down".into(),
        });
        failed.tripped = true;
        stats.record(&failed);

        let taken = stats.take();
        assert_eq!(taken.runs, 2);
        assert_eq!(taken.successes, 1);
        assert_eq!(taken.failures, 1);
        assert_eq!(taken.circuit_skips, 1);
        assert_eq!(taken.trips, 1);
        assert_eq!(taken.changes, 6);
        assert_eq!(stats, RunStats::default());
    }

    #[test]
    fn test_stale_sources() {
        let schedule = ScheduleConfig::default();
        let now = t0() + Duration::hours(5);
        let sources = vec![
            SourceHealth {
                id: "fresh".into(),
                tier: Tier::P1,
                last_success: Some(now - Duration::minutes(30)),
            },
            SourceHealth {
                id: "old".into(),
                tier: Tier::P2,
                last_success: Some(now - Duration::hours(3)),
            },
            SourceHealth {
                id: "never".into(),
                tier: Tier::P1,
                last_success: None,
            },
        ];

        let stale = stale_sources(&sources, &schedule, t0(), now);
        let ids: Vec<&str> = stale.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["never", "old"]);
        assert!(stale[0].never_updated);
    }

    #[test]
    fn test_never_updated_is_not_stale_right_after_startup() {
        let schedule = ScheduleConfig::default();
        let sources = vec![SourceHealth {
            id: "new".into(),
            tier: Tier::P2,
            last_success: None,
        }];
        assert!(stale_sources(&sources, &schedule, t0(), t0() + Duration::minutes(90)).is_empty());
    }

    #[test]
    fn test_format_report() {
        let stats = RunStats {
            runs: 12,
            successes: 10,
            failures: 2,
            changes: 3,
            ..RunStats::default()
        };
        let stale = vec![StaleSource {
            id: "old".into(),
            tier: Tier::P2,
            age: Duration::minutes(185),
            never_updated: false,
        }];
        let text = format_report(&stats, Duration::hours(1), t0(), 4, &stale);
        assert!(text.contains("period: 1h 0m"));
        assert!(text.contains("runs: 12 (ok 10, failed 2)"));
        assert!(text.contains("sources: 3 fresh, 1 stale"));
        assert!(text.ends_with("⚠ old [P2] 3h 5m"));
    }
}
