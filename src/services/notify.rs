// src/services/notify.rs

//! Outbound notifications: transport trait, ChatWork and log transports,
//! and alert formatting.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{AppError, Result};
use crate::models::{ChangedItem, NotifyConfig, NotifyKind, SourceConfig};
use crate::resilience::{BackoffPolicy, Retryable};

/// Most item lines in one alert.
pub const MAX_ALERT_ITEMS: usize = 20;

/// Attempts per message.
pub const SEND_ATTEMPTS: u32 = 3;

/// Why a message was not delivered.
#[derive(Debug, Error)]
pub enum SendError {
    /// Transport failure (connect, timeout, body)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with an error status
    #[error("rejected with status {status}: {body}")]
    Status { status: u16, body: String },
}

impl Retryable for SendError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Delivers a text message to a target (chat room).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, target: &str, text: &str) -> std::result::Result<(), SendError>;
}

/// Send with bounded retries. Failures are logged by the caller.
pub async fn send_with_retry(
    notifier: &dyn Notifier,
    policy: &BackoffPolicy,
    target: &str,
    text: &str,
) -> std::result::Result<(), SendError> {
    policy
        .retry(
            "notify",
            || notifier.send(target, text),
            <SendError as Retryable>::is_retryable,
        )
        .await
        .map_err(|exhausted| exhausted.error)
}

/// ChatWork rooms API transport.
pub struct ChatworkNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ChatworkNotifier {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn endpoint(&self, room: &str) -> String {
        format!("{}/rooms/{}/messages", self.base_url, room)
    }
}

#[async_trait]
impl Notifier for ChatworkNotifier {
    async fn send(&self, target: &str, text: &str) -> std::result::Result<(), SendError> {
        let response = self
            .client
            .post(self.endpoint(target))
            .header("X-ChatWorkToken", &self.token)
            .form(&[("body", text)])
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            log::debug!("Message delivered to room {}", target);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SendError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        })
    }
}

/// Transport that only writes messages to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, target: &str, text: &str) -> std::result::Result<(), SendError> {
        log::info!("[notify -> {}]\n{}", target, text);
        Ok(())
    }
}

/// Build the configured transport.
///
/// A missing ChatWork token is a startup error.
pub fn build_notifier(config: &NotifyConfig, client: &reqwest::Client) -> Result<Arc<dyn Notifier>> {
    match config.kind {
        NotifyKind::Log => Ok(Arc::new(LogNotifier)),
        NotifyKind::Chatwork => {
            let token = std::env::var(&config.token_env)
                .ok()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| {
                    AppError::config(format!(
                        "notify.kind is chatwork but {} is not set",
                        config.token_env
                    ))
                })?;
            Ok(Arc::new(ChatworkNotifier::new(
                client.clone(),
                config.base_url.clone(),
                token,
            )))
        }
    }
}

/// Alert text for the changed items of one source.
pub fn format_alert(source: &SourceConfig, items: &[ChangedItem]) -> String {
    let mut lines = vec![format!("🔔 {} {}", source.name, source.category)];
    if let Some(url) = &source.url {
        lines.push(url.clone());
    }
    lines.push(String::new());
    for changed in items.iter().take(MAX_ALERT_ITEMS) {
        lines.push(format!(
            "▪ {}・{}",
            changed.item.name,
            changed.item.price_label()
        ));
    }
    if items.len() > MAX_ALERT_ITEMS {
        lines.push(format!("...and {} more", items.len() - MAX_ALERT_ITEMS));
    }
    lines.join("\n")
}
