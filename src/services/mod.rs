// src/services/mod.rs

//! Collaborators the engine talks to through traits.
//!
//! - Fetchers (`Fetcher`): external scraper programs and CSS-selector pages
//! - Notifiers (`Notifier`): ChatWork rooms or the log

mod command;
mod fetch;
mod html;
mod notify;

pub use command::{CommandFetcher, MAX_OUTPUT_BYTES, extract_price, parse_line, parse_output};
pub use fetch::{FetchError, Fetcher, build_fetcher};
pub use html::HtmlFetcher;
pub use notify::{
    ChatworkNotifier, LogNotifier, MAX_ALERT_ITEMS, Notifier, SEND_ATTEMPTS, SendError,
    build_notifier, format_alert, send_with_retry,
};
