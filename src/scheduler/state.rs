// src/scheduler/state.rs

//! Per-source schedule state and the P1 interval policy.

use std::cmp::Ordering;

use chrono::{DateTime, Duration, Utc};

use crate::models::{ScheduleConfig, Tier, seconds};
use crate::pipeline::{RunOutcome, RunReport};

/// Adaptive interval policy for P1 sources.
///
/// - changes reported: back to the minimum
/// - unchanged success: interval x 1.5
/// - exhausted failure: interval x 2
/// - circuit-open skip: unchanged
///
/// Every result is clamped to `[min, max]`. Inside the night window the
/// effective interval is the night interval regardless of the computed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P1Policy {
    pub min: Duration,
    pub max: Duration,
    pub night: NightWindow,
}

/// Local hours during which both tiers slow down to a fixed interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub interval: Duration,
}

impl NightWindow {
    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self {
            start_hour: config.night_start_hour,
            end_hour: config.night_end_hour,
            interval: seconds(config.night_interval_secs),
        }
    }

    /// Whether `hour` falls inside the window. A window may wrap midnight.
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

impl P1Policy {
    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self {
            min: seconds(config.p1_min_secs),
            max: seconds(config.p1_max_secs),
            night: NightWindow::from_config(config),
        }
    }

    fn clamp(&self, interval: Duration) -> Duration {
        interval.clamp(self.min, self.max)
    }

    /// Computed interval after a run with `outcome`.
    pub fn next_interval(&self, current: Duration, outcome: &RunOutcome) -> Duration {
        let next = match outcome {
            RunOutcome::Updated { changes } if *changes > 0 => self.min,
            RunOutcome::Updated { .. } => current * 3 / 2,
            RunOutcome::Failed { .. } => current * 2,
            RunOutcome::CircuitOpen { .. } => current,
        };
        self.clamp(next)
    }

    /// Interval actually waited at `local_hour`.
    pub fn effective(&self, interval: Duration, local_hour: u32) -> Duration {
        if self.night.contains(local_hour) {
            self.night.interval
        } else {
            interval
        }
    }
}

/// Scheduling bookkeeping of one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleState {
    pub source_id: String,
    pub tier: Tier,
    pub last_run: Option<DateTime<Utc>>,
    pub next_due: DateTime<Utc>,
    /// Computed P1 interval (unused for P2)
    pub interval: Duration,
    pub consecutive_failures: u32,
    /// Successful runs in a row without changes
    pub consecutive_quiet: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub in_flight: bool,
}

impl ScheduleState {
    /// Fresh state, due immediately.
    pub fn new(source_id: impl Into<String>, tier: Tier, now: DateTime<Utc>, interval: Duration) -> Self {
        Self {
            source_id: source_id.into(),
            tier,
            last_run: None,
            next_due: now,
            interval,
            consecutive_failures: 0,
            consecutive_quiet: 0,
            last_success: None,
            in_flight: false,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.in_flight && self.next_due <= now
    }

    /// Update counters from a finished run. `next_due` is left to the tier.
    pub fn record(&mut self, report: &RunReport) {
        self.in_flight = false;
        self.last_run = Some(report.finished_at);
        match &report.outcome {
            RunOutcome::Updated { changes } => {
                self.consecutive_failures = 0;
                self.last_success = Some(report.finished_at);
                if *changes > 0 {
                    self.consecutive_quiet = 0;
                } else {
                    self.consecutive_quiet += 1;
                }
            }
            RunOutcome::Failed { .. } => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
            RunOutcome::CircuitOpen { .. } => {}
        }
    }

    /// Apply a finished P1 run: counters, interval and next due time.
    pub fn apply_p1(&mut self, report: &RunReport, policy: &P1Policy, local_hour: u32) {
        self.record(report);
        self.interval = policy.next_interval(self.interval, &report.outcome);
        self.next_due = report.finished_at + policy.effective(self.interval, local_hour);
    }
}

/// Dispatch order among due sources: failing sources first, then earliest
/// due time, then id.
pub fn dispatch_order(a: (&ScheduleState, bool), b: (&ScheduleState, bool)) -> Ordering {
    let (a, a_failing) = a;
    let (b, b_failing) = b;
    b_failing
        .cmp(&a_failing)
        .then_with(|| a.next_due.cmp(&b.next_due))
        .then_with(|| a.source_id.cmp(&b.source_id))
}
