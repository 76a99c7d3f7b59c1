// src/resilience/backoff.rs

//! Exponential backoff with full jitter.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::models::ResilienceConfig;

/// Capped exponential backoff.
///
/// The delay after the `n`-th failed attempt (0-based) is
/// `min(max, base * 2^n)`; [`BackoffPolicy::jittered`] adds a uniform jitter
/// in `[0, delay)` on top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    max_attempts: u32,
}

/// An operation that failed on every attempt it was given.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts actually made (a non-retryable error stops early)
    pub attempts: u32,
    /// Error of the last attempt
    pub error: E,
    /// Last delay slept before the final attempt
    pub last_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Same delays with a different attempt budget.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Un-jittered delay after the given failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay plus uniform jitter in `[0, delay)`.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let nanos = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return delay;
        }
        let jitter = rand::rng().random_range(0..nanos);
        delay + Duration::from_nanos(jitter)
    }

    /// Run `op` until it succeeds, the budget runs out, or it fails with an
    /// error `retryable` rejects.
    pub async fn retry<T, E, F, Fut>(
        &self,
        label: &str,
        mut op: F,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, Exhausted<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 0;
        let mut last_delay = Duration::ZERO;
        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            let attempts = attempt + 1;
            if !retryable(&error) {
                log::debug!("{label}: non-retryable failure on attempt {attempts}: {error}");
                return Err(Exhausted {
                    attempts,
                    error,
                    last_delay,
                });
            }
            if attempts >= self.max_attempts {
                return Err(Exhausted {
                    attempts,
                    error,
                    last_delay,
                });
            }

            let wait = self.jittered(attempt);
            log::debug!(
                "{label}: attempt {attempts}/{} failed ({error}), retrying in {:?}",
                self.max_attempts,
                wait
            );
            tokio::time::sleep(wait).await;
            last_delay = wait;
            attempt += 1;
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ResilienceConfig::default())
    }
}

impl From<&ResilienceConfig> for BackoffPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_secs(config.max_delay_secs),
            config.max_attempts,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(50), Duration::from_secs(300), 10)
    }

    #[test]
    fn test_delay_doubles_then_caps() {
        let p = policy();
        assert_eq!(p.delay(0), Duration::from_millis(50));
        assert_eq!(p.delay(1), Duration::from_millis(100));
        assert_eq!(p.delay(4), Duration::from_millis(800));
        assert_eq!(p.delay(20), Duration::from_secs(300));
        assert_eq!(p.delay(64), Duration::from_secs(300));
    }

    #[test]
    fn test_delay_is_monotone() {
        let p = policy();
        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let d = p.delay(attempt);
            assert!(d >= previous);
            assert!(d <= Duration::from_secs(300));
            previous = d;
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let p = policy();
        for attempt in 0..30 {
            for _ in 0..20 {
                let d = p.jittered(attempt);
                assert!(d >= p.delay(attempt));
                assert!(d < p.delay(attempt) * 2);
                assert!(d < Duration::from_secs(600));
            }
        }
    }

    #[test]
    fn test_zero_base_has_no_jitter() {
        let p = BackoffPolicy::new(Duration::ZERO, Duration::ZERO, 3);
        assert_eq!(p.jittered(5), Duration::ZERO);
    }

    #[test]
    fn test_default_matches_config_defaults() {
        let p = BackoffPolicy::default();
        assert_eq!(p.max_attempts(), 10);
        assert_eq!(p.delay(0), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = Cell::new(0);
        let result: Result<u32, Exhausted<String>> = policy()
            .retry(
                "test",
                || {
                    calls.set(calls.get() + 1);
                    let n = calls.get();
                    async move { if n < 3 { Err("boom".to_string()) } else { Ok(n) } }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_budget() {
        let calls = Cell::new(0);
        let result: Result<(), Exhausted<String>> = policy()
            .with_max_attempts(4)
            .retry(
                "test",
                || {
                    calls.set(calls.get() + 1);
                    async { Err("down".to_string()) }
                },
                |_| true,
            )
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 4);
        assert_eq!(calls.get(), 4);
        assert!(exhausted.last_delay >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_non_retryable() {
        let calls = Cell::new(0);
        let result: Result<(), Exhausted<String>> = policy()
            .retry(
                "test",
                || {
                    calls.set(calls.get() + 1);
                    async { Err("forbidden".to_string()) }
                },
                |e| e != "forbidden",
            )
            .await;
        let exhausted = result.unwrap_err();
        assert_eq!(exhausted.attempts, 1);
        assert_eq!(exhausted.last_delay, Duration::ZERO);
        assert_eq!(calls.get(), 1);
    }
}
