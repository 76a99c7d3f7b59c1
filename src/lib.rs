// src/lib.rs

//! shopwatch: watches second-hand shop listings and sends deduplicated alerts.

pub mod app;
pub mod clock;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod resilience;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod utils;
