// src/pipeline/mod.rs

//! Per-source processing.
//!
//! - `normalize`: text normalization and item hashing
//! - `diff`: change detection against the stored snapshot
//! - `run`: one fetch, diff, dedup, notify and commit cycle
//! - `report`: run statistics and stale source detection

pub mod diff;
pub mod normalize;
pub mod report;
pub mod run;

pub use diff::{ChangeDetector, DiffOutcome};
pub use normalize::{Normalizer, normalize_text};
pub use report::{RunStats, SourceHealth, StaleSource, format_report, stale_sources};
pub use run::{RunContext, RunOutcome, RunReport, run_detached, run_source};
