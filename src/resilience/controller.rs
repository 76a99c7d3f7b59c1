// src/resilience/controller.rs

//! Circuit breaker plus backoff around one source's fallible operation.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::clock::Clock;
use crate::models::{ResilienceConfig, seconds};

use super::Retryable;
use super::backoff::BackoffPolicy;
use super::circuit_breaker::{CircuitState, CircuitStatus};

/// Why an execution did not produce a value.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    /// The circuit is open; nothing was attempted
    #[error("circuit open, retry in {}s", .retry_in.as_secs())]
    CircuitOpen { retry_in: Duration },

    /// Every attempt failed
    #[error("failed after {attempts} attempt(s): {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: E },
}

impl<E> ExecuteError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// Shared executor; the per-source [`CircuitState`] is passed in by the caller.
#[derive(Clone)]
pub struct ResilienceController {
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    failure_threshold: u32,
    cooldown: chrono::Duration,
}

impl ResilienceController {
    pub fn new(config: &ResilienceConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            backoff: BackoffPolicy::from(config),
            failure_threshold: config.failure_threshold,
            cooldown: seconds(config.cooldown_secs),
        }
    }

    /// A closed circuit with this controller's threshold and cooldown.
    pub fn new_circuit(&self) -> CircuitState {
        CircuitState::new(self.failure_threshold, self.cooldown)
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run `operation` for `source_id` under `circuit`.
    ///
    /// Open circuits fail fast without counting a failure. Otherwise the
    /// operation is retried with backoff; exhausting the attempts (or a
    /// non-retryable error) counts as one breaker failure.
    pub async fn execute<T, E, F, Fut>(
        &self,
        source_id: &str,
        circuit: &mut CircuitState,
        operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        if let Err(retry_in) = circuit.try_acquire(self.clock.now()) {
            log::debug!(
                "[{}] circuit open, skipping (retry in {}s)",
                source_id,
                retry_in.as_secs()
            );
            return Err(ExecuteError::CircuitOpen { retry_in });
        }
        let trial = circuit.status() == CircuitStatus::HalfOpen;
        if trial {
            log::info!("[{}] circuit half-open, running trial", source_id);
        }

        match self
            .backoff
            .retry(source_id, operation, <E as Retryable>::is_retryable)
            .await
        {
            Ok(value) => {
                if trial {
                    log::info!("[{}] trial succeeded, circuit closed", source_id);
                }
                circuit.record_success();
                Ok(value)
            }
            Err(exhausted) => {
                let opened = circuit.record_failure(self.clock.now(), exhausted.last_delay);
                if opened {
                    log::warn!(
                        "[{}] circuit opened after {} consecutive failure(s): {}",
                        source_id,
                        circuit.failures(),
                        exhausted.error
                    );
                } else {
                    log::warn!(
                        "[{}] failed after {} attempt(s) ({} consecutive): {}",
                        source_id,
                        exhausted.attempts,
                        circuit.failures(),
                        exhausted.error
                    );
                }
                Err(ExecuteError::ExhaustedRetries {
                    attempts: exhausted.attempts,
                    last_error: exhausted.error,
                })
            }
        }
    }
}
