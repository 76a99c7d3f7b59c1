// src/models/source.rs

//! Source definitions: what to watch, how often, and where to alert.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Scheduling tier of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Adaptive per-source interval.
    #[serde(alias = "p1", alias = "1")]
    P1,
    /// Full-cycle sweep.
    #[serde(alias = "p2", alias = "2")]
    P2,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::P1 => f.write_str("P1"),
            Tier::P2 => f.write_str("P2"),
        }
    }
}

/// One monitored source, as read from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique identifier; also names the snapshot file
    pub id: String,

    /// Display name used in alerts and reports
    pub name: String,

    /// Listing category (e.g. "cameras", "lenses")
    #[serde(default = "default_category")]
    pub category: String,

    /// Scheduling tier
    pub tier: Tier,

    /// Inactive sources are loaded but never scheduled
    #[serde(default = "default_active")]
    pub active: bool,

    /// Page shown in alerts
    #[serde(default)]
    pub url: Option<String>,

    /// Notification targets (chat room ids)
    #[serde(default)]
    pub notify: Vec<String>,

    /// How to fetch the listing
    pub fetch: FetchSpec,
}

impl SourceConfig {
    /// Whether `id` is safe to use as a file name component.
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && id != "."
            && id != ".."
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    }

    /// Label used in log lines, e.g. `[P1 hatosya]`.
    pub fn label(&self) -> String {
        format!("[{} {}]", self.tier, self.id)
    }
}

fn default_category() -> String {
    "new arrivals".into()
}

fn default_active() -> bool {
    true
}

/// Fetch capability of a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FetchSpec {
    /// Run an external scraper and parse its stdout.
    Command(CommandSpec),
    /// Download a page and extract items with CSS selectors.
    Html(HtmlSpec),
}

/// External scraper invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program to execute
    pub program: String,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory (defaults to the current one)
    #[serde(default)]
    pub workdir: Option<String>,

    /// Per-run timeout; falls back to the global scraper timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Output section to keep when the scraper covers several pages
    /// (`---URL_INDEX:n---` markers). `None` keeps every section.
    #[serde(default)]
    pub url_index: Option<u32>,
}

/// Selector-driven page extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtmlSpec {
    /// Listing page URL
    pub url: String,

    /// CSS selector matching one element per item
    pub item: String,

    /// CSS selector for the item name, relative to the item
    pub name: String,

    /// CSS selector for the price text
    #[serde(default)]
    pub price: Option<String>,

    /// CSS selector for the status text (sold out, reserved, ...)
    #[serde(default)]
    pub status: Option<String>,

    /// CSS selector for the item image
    #[serde(default)]
    pub image: Option<String>,

    /// Attribute holding the image URL
    #[serde(default = "default_image_attr")]
    pub image_attr: String,

    /// CSS selector for the item link
    #[serde(default)]
    pub link: Option<String>,

    /// Attribute holding the link URL
    #[serde(default = "default_link_attr")]
    pub link_attr: String,
}

fn default_image_attr() -> String {
    "src".into()
}

fn default_link_attr() -> String {
    "href".into()
}
