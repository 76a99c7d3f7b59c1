// src/scheduler/mod.rs

//! Dual-priority scheduler.
//!
//! - P1 sources run on an adaptive per-source interval ([`P1Policy`])
//! - P2 sources are swept in full cycles ([`P2Cycle`])
//!
//! Both tiers share one worker limiter and one control loop ([`Scheduler`]).

mod engine;
mod p2;
mod state;

pub use engine::Scheduler;
pub use p2::{CycleSummary, MIN_CYCLE_GAP_SECS, P2Cycle};
pub use state::{NightWindow, P1Policy, ScheduleState, dispatch_order};
