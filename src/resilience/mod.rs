// src/resilience/mod.rs

//! Fault isolation for source operations.
//!
//! - [`BackoffPolicy`]: capped exponential backoff with jitter, also used by
//!   the dedup store and the notifier
//! - [`CircuitState`]: per-source breaker state
//! - [`ResilienceController`]: runs an operation under both

mod backoff;
mod circuit_breaker;
mod controller;

pub use backoff::{BackoffPolicy, Exhausted};
pub use circuit_breaker::{CircuitState, CircuitStatus};
pub use controller::{ExecuteError, ResilienceController};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}
