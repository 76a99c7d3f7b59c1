// src/models/mod.rs

//! Domain models for the watcher.
//!
//! Configuration (sources, schedule and engine settings) and the item and
//! snapshot types that flow through the pipeline.

mod config;
mod item;
mod source;

pub use config::{
    Config, DedupConfig, EngineConfig, HttpConfig, MAX_PERIOD_SECS, NotifyConfig, NotifyKind,
    P1_INTERVAL_BOUNDS, PathsConfig, ResilienceConfig, ScheduleConfig, seconds,
};
pub use item::{ChangeKind, ChangedItem, Item, ItemRecord, Snapshot, StoredSnapshot};
pub use source::{CommandSpec, FetchSpec, HtmlSpec, SourceConfig, Tier};
