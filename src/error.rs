// src/error.rs

//! Unified error handling for the watcher application.
//!
//! Component boundaries (fetch, notify, dedup, resilience) carry their own
//! error enums; everything that reaches startup code or the CLI is folded
//! into [`AppError`].

use std::fmt;

use thiserror::Error;

/// Result type alias for application operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// SQLite operation failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Persistence layer error
    #[error("Storage error for {context}: {message}")]
    Storage { context: String, message: String },
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a storage error with context.
    pub fn storage(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Storage {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Severity of the error in `phase`. Anything that reaches startup code
    /// stops the process, so it is fatal there whatever its kind.
    pub fn severity_in(&self, phase: Phase) -> ErrorSeverity {
        match phase {
            Phase::Startup => ErrorSeverity::Fatal,
            Phase::Runtime => self.severity(),
        }
    }

    /// Severity class used when the error is logged at runtime.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Config(_) | Self::Validation(_) | Self::Toml(_) => ErrorSeverity::Fatal,
            Self::Http(_) | Self::Sqlite(_) => ErrorSeverity::Recoverable,
            Self::Io(_) | Self::Json(_) | Self::Storage { .. } => ErrorSeverity::Expected,
        }
    }
}

/// Where an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Loading config or opening persistence, before the scheduler runs.
    Startup,
    /// Inside a scheduled run.
    Runtime,
}

/// How an error affects the process.
///
/// Only startup code acts on [`ErrorSeverity::Fatal`]; at runtime every
/// error is logged and counted, and scheduling continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Transient; retried before it is ever surfaced.
    Recoverable,
    /// Part of normal operation (open circuit, suppressed alert, failed send).
    Expected,
    /// Unrecoverable at startup.
    Fatal,
}

impl ErrorSeverity {
    /// Log level matching the severity.
    pub fn level(self) -> log::Level {
        match self {
            Self::Recoverable => log::Level::Warn,
            Self::Expected => log::Level::Info,
            Self::Fatal => log::Level::Error,
        }
    }
}

/// Log an error at the level its severity in `phase` calls for.
pub fn report(context: &str, error: &AppError, phase: Phase) {
    let severity = error.severity_in(phase);
    log::log!(severity.level(), "[{}] {:?}: {}", context, severity, error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_are_fatal() {
        assert_eq!(AppError::config("missing").severity(), ErrorSeverity::Fatal);
        assert_eq!(
            AppError::validation("bad id").severity(),
            ErrorSeverity::Fatal
        );
    }

    #[test]
    fn test_storage_errors_are_expected() {
        let err = AppError::storage("snapshot", "disk full");
        assert_eq!(err.severity(), ErrorSeverity::Expected);
        assert_eq!(err.to_string(), "Storage error for snapshot: disk full");
    }

    #[test]
    fn test_startup_failures_are_fatal() {
        let storage = AppError::storage("data/snapshots", "permission denied");
        let sqlite = AppError::Sqlite(rusqlite::Error::InvalidQuery);
        for err in [storage, sqlite] {
            assert_ne!(err.severity(), ErrorSeverity::Fatal);
            assert_eq!(err.severity_in(Phase::Startup), ErrorSeverity::Fatal);
            assert_eq!(err.severity_in(Phase::Startup).level(), log::Level::Error);
            assert_eq!(err.severity_in(Phase::Runtime), err.severity());
        }
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(ErrorSeverity::Recoverable.level(), log::Level::Warn);
        assert_eq!(ErrorSeverity::Fatal.level(), log::Level::Error);
    }
}
