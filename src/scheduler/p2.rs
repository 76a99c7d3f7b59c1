// src/scheduler/p2.rs

//! Full-cycle sweep for P2 sources.
//!
//! A cycle queues every active P2 source once. The next cycle may only start
//! after each queued source has finished, and then no sooner than
//! `max(5s, cycle_interval - cycle_duration)` after the last one finished.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};

use crate::models::{ScheduleConfig, seconds};
use crate::scheduler::state::NightWindow;

/// Minimum pause between two cycles.
pub const MIN_CYCLE_GAP_SECS: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle { next_start: DateTime<Utc> },
    Running {
        started_at: DateTime<Utc>,
        pending: BTreeSet<String>,
    },
}

/// Summary of a finished cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub number: u64,
    pub sources: usize,
    pub duration: Duration,
    pub next_start: DateTime<Utc>,
}

/// State machine of the P2 sweep.
#[derive(Debug, Clone)]
pub struct P2Cycle {
    phase: Phase,
    interval: Duration,
    night: NightWindow,
    cycles: u64,
    size: usize,
}

impl P2Cycle {
    /// First cycle may start at `now`.
    pub fn new(config: &ScheduleConfig, now: DateTime<Utc>) -> Self {
        Self {
            phase: Phase::Idle { next_start: now },
            interval: seconds(config.p2_cycle_secs),
            night: NightWindow::from_config(config),
            cycles: 0,
            size: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }

    /// When the next cycle may start, `None` while one is running.
    pub fn next_start(&self) -> Option<DateTime<Utc>> {
        match &self.phase {
            Phase::Idle { next_start } => Some(*next_start),
            Phase::Running { .. } => None,
        }
    }

    /// Sources of the running cycle that have not finished yet.
    pub fn pending(&self) -> usize {
        match &self.phase {
            Phase::Running { pending, .. } => pending.len(),
            Phase::Idle { .. } => 0,
        }
    }

    pub fn completed_cycles(&self) -> u64 {
        self.cycles
    }

    /// Start a cycle over `sources` if one is due. Returns the queued ids.
    pub fn try_start<I>(&mut self, sources: I, now: DateTime<Utc>) -> Vec<String>
    where
        I: IntoIterator<Item = String>,
    {
        let Phase::Idle { next_start } = self.phase else {
            return Vec::new();
        };
        if now < next_start {
            return Vec::new();
        }
        let pending: BTreeSet<String> = sources.into_iter().collect();
        if pending.is_empty() {
            return Vec::new();
        }
        let queued: Vec<String> = pending.iter().cloned().collect();
        self.size = pending.len();
        self.phase = Phase::Running {
            started_at: now,
            pending,
        };
        queued
    }

    /// Mark `source_id` finished. Returns the summary when this completes
    /// the cycle.
    pub fn finish(&mut self, source_id: &str, now: DateTime<Utc>, local_hour: u32) -> Option<CycleSummary> {
        let Phase::Running {
            started_at,
            pending,
        } = &mut self.phase
        else {
            return None;
        };
        pending.remove(source_id);
        if !pending.is_empty() {
            return None;
        }

        let duration = now - *started_at;
        let interval = if self.night.contains(local_hour) {
            self.night.interval
        } else {
            self.interval
        };
        let gap = (interval - duration).max(Duration::seconds(MIN_CYCLE_GAP_SECS));
        let next_start = now + gap;
        self.phase = Phase::Idle { next_start };
        self.cycles += 1;

        Some(CycleSummary {
            number: self.cycles,
            sources: self.size,
            duration,
            next_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cycle_waits_for_every_source() {
        let mut cycle = P2Cycle::new(&ScheduleConfig::default(), t0());
        let queued = cycle.try_start(ids(&["b", "a", "c"]), t0());
        assert_eq!(queued, ids(&["a", "b", "c"]));
        assert!(cycle.is_running());

        assert!(cycle.try_start(ids(&["a"]), t0() + Duration::hours(1)).is_empty());
        assert!(cycle.finish("a", t0() + Duration::seconds(10), 12).is_none());
        assert!(cycle.finish("c", t0() + Duration::seconds(20), 12).is_none());
        assert_eq!(cycle.pending(), 1);

        let summary = cycle.finish("b", t0() + Duration::seconds(100), 12).unwrap();
        assert_eq!(summary.number, 1);
        assert_eq!(summary.sources, 3);
        assert_eq!(summary.duration, Duration::seconds(100));
        assert_eq!(summary.next_start, t0() + Duration::seconds(300));
    }

    #[test]
    fn test_long_cycle_uses_minimum_gap() {
        let mut cycle = P2Cycle::new(&ScheduleConfig::default(), t0());
        cycle.try_start(ids(&["a"]), t0());
        let end = t0() + Duration::seconds(900);
        let summary = cycle.finish("a", end, 12).unwrap();
        assert_eq!(summary.next_start, end + Duration::seconds(5));

        assert!(cycle.try_start(ids(&["a"]), end + Duration::seconds(4)).is_empty());
        assert_eq!(cycle.try_start(ids(&["a"]), end + Duration::seconds(5)), ids(&["a"]));
    }

    #[test]
    fn test_night_cycle_interval() {
        let mut cycle = P2Cycle::new(&ScheduleConfig::default(), t0());
        cycle.try_start(ids(&["a"]), t0());
        let summary = cycle.finish("a", t0() + Duration::seconds(60), 2).unwrap();
        assert_eq!(summary.next_start, t0() + Duration::seconds(1800));
    }

    #[test]
    fn test_no_sources_no_cycle() {
        let mut cycle = P2Cycle::new(&ScheduleConfig::default(), t0());
        assert!(cycle.try_start(Vec::new(), t0()).is_empty());
        assert!(!cycle.is_running());
    }
}
