// src/clock.rs

//! Time source abstraction.
//!
//! Every time comparison in the engine (circuit cooldowns, dedup windows,
//! schedule deadlines) reads the clock through [`Clock`] so tests can drive
//! time explicitly with [`ManualClock`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Local, Timelike, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Current instant in UTC.
    fn now(&self) -> DateTime<Utc>;

    /// Hour of day (0-23) in local time, used for the night window.
    fn local_hour(&self) -> u32 {
        self.now().with_timezone(&Local).hour()
    }
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Clones share the same underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualTime>>,
}

#[derive(Debug)]
struct ManualTime {
    now: DateTime<Utc>,
    local_hour: Option<u32>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualTime {
                now: start,
                local_hour: None,
            })),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut time = self.lock();
        time.now += by;
    }

    /// Jump to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        self.lock().now = to;
    }

    /// Pin the reported local hour regardless of the instant.
    pub fn set_local_hour(&self, hour: u32) {
        self.lock().local_hour = Some(hour % 24);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualTime> {
        // The guarded value is plain data; a poisoned lock still holds a valid instant.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    fn local_hour(&self) -> u32 {
        let time = self.lock();
        time.local_hour
            .unwrap_or_else(|| time.now.with_timezone(&Local).hour())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_advances_shared_instant() {
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let other = clock.clone();

        clock.advance(Duration::minutes(90));
        assert_eq!(other.now(), start + Duration::minutes(90));
    }

    #[test]
    fn test_pinned_local_hour() {
        let clock = ManualClock::new(Utc::now());
        clock.set_local_hour(3);
        assert_eq!(clock.local_hour(), 3);
        clock.set_local_hour(27);
        assert_eq!(clock.local_hour(), 3);
    }
}
