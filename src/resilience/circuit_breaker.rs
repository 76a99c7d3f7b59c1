// src/resilience/circuit_breaker.rs

//! Per-source circuit breaker state.
//!
//! ```text
//!   Closed --(threshold failures)--> Open --(cooldown elapsed)--> HalfOpen
//!     ^                                ^                              |
//!     |                                +---------(trial fails)--------+
//!     +-------------------------(trial succeeds)----------------------+
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitStatus {
    /// Normal operation, calls pass through
    Closed,
    /// Failing fast until the cooldown elapses
    Open,
    /// One trial call is in progress
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Breaker state of one source. Lives in memory only.
#[derive(Debug, Clone)]
pub struct CircuitState {
    status: CircuitStatus,
    failures: u32,
    opened_at: Option<DateTime<Utc>>,
    last_delay: Duration,
    trips: u64,
    threshold: u32,
    cooldown: chrono::Duration,
}

impl CircuitState {
    /// A closed circuit that opens after `threshold` consecutive failures
    /// and stays open for `cooldown`.
    pub fn new(threshold: u32, cooldown: chrono::Duration) -> Self {
        Self {
            status: CircuitStatus::Closed,
            failures: 0,
            opened_at: None,
            last_delay: Duration::ZERO,
            trips: 0,
            threshold: threshold.max(1),
            cooldown,
        }
    }

    pub fn status(&self) -> CircuitStatus {
        self.status
    }

    /// Consecutive failed executions.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at
    }

    /// Last backoff delay slept by an execution.
    pub fn last_delay(&self) -> Duration {
        self.last_delay
    }

    /// Number of times this circuit has opened.
    pub fn trips(&self) -> u64 {
        self.trips
    }

    /// Whether the source is currently in a failed state.
    pub fn is_failing(&self) -> bool {
        self.failures > 0 || self.status != CircuitStatus::Closed
    }

    /// Whether a call at `now` would be attempted.
    pub fn allows(&self, now: DateTime<Utc>) -> bool {
        self.retry_in(now).is_none()
    }

    /// Time left until an open circuit admits its trial, `None` when a call
    /// would be attempted now.
    pub fn retry_in(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.status != CircuitStatus::Open {
            return None;
        }
        let opened_at = self.opened_at?;
        let remaining = opened_at + self.cooldown - now;
        if remaining <= chrono::Duration::zero() {
            None
        } else {
            remaining.to_std().ok()
        }
    }

    /// Claim the right to call at `now`.
    ///
    /// An open circuit whose cooldown has elapsed moves to half-open; one
    /// still cooling down returns the remaining time.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> Result<(), Duration> {
        if let Some(remaining) = self.retry_in(now) {
            return Err(remaining);
        }
        if self.status == CircuitStatus::Open {
            self.status = CircuitStatus::HalfOpen;
        }
        Ok(())
    }

    /// Record a successful execution.
    pub fn record_success(&mut self) {
        self.status = CircuitStatus::Closed;
        self.failures = 0;
        self.opened_at = None;
        self.last_delay = Duration::ZERO;
    }

    /// Record a failed execution. Returns `true` when this failure opened
    /// the circuit.
    pub fn record_failure(&mut self, now: DateTime<Utc>, last_delay: Duration) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.last_delay = last_delay;
        let trip = match self.status {
            CircuitStatus::HalfOpen => true,
            CircuitStatus::Closed => self.failures >= self.threshold,
            CircuitStatus::Open => false,
        };
        if trip {
            self.status = CircuitStatus::Open;
            self.opened_at = Some(now);
            self.trips += 1;
        }
        trip
    }
}
