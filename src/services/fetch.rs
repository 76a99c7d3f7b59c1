// src/services/fetch.rs

//! Fetcher interface and its error type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::clock::Clock;
use crate::models::{FetchSpec, Snapshot};
use crate::resilience::Retryable;
use crate::services::command::CommandFetcher;
use crate::services::html::HtmlFetcher;

/// Why a fetch produced no snapshot.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Request failed or returned an error status
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Scraper program could not be started
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Scraper program exited unsuccessfully
    #[error("command failed: {0}")]
    Command(String),

    /// Fetch did not finish in time
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Page or output contained no items
    #[error("no items found")]
    Empty,

    /// Output could not be used at all
    #[error("invalid output: {0}")]
    Invalid(String),

    /// The worker pool shut down
    #[error("fetch cancelled")]
    Cancelled,
}

impl Retryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => match e.status() {
                Some(status) => status.is_server_error() || status.as_u16() == 429,
                None => true,
            },
            Self::Command(_) | Self::Timeout(_) | Self::Empty => true,
            Self::Spawn { .. } | Self::Invalid(_) | Self::Cancelled => false,
        }
    }
}

/// Fetch capability of one source.
///
/// Implementations are idempotent: fetching twice in a row is harmless.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self) -> Result<Snapshot, FetchError>;
}

/// Build the fetcher described by a source's [`FetchSpec`].
pub fn build_fetcher(
    spec: &FetchSpec,
    client: &reqwest::Client,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
) -> crate::error::Result<Arc<dyn Fetcher>> {
    let fetcher: Arc<dyn Fetcher> = match spec {
        FetchSpec::Command(spec) => Arc::new(CommandFetcher::new(spec.clone(), clock, default_timeout)),
        FetchSpec::Html(spec) => Arc::new(HtmlFetcher::new(spec.clone(), client.clone(), clock)?),
    };
    Ok(fetcher)
}
