// src/services/command.rs

//! External scraper adapter.
//!
//! Runs a scraper program and reads items from its stdout, one per line:
//!
//! ```text
//! Leica M6 Black 250,000円||https://img.example.com/m6.jpg
//! Nikon F3 ¥60,000
//! ```
//!
//! The text before `||` holds the name and price; the text after it is the
//! image URL. Lines without a plausible price, short lines, and lines that
//! look like log output are ignored.
//!
//! A scraper that covers several pages separates them with section markers.
//! Lines before the first marker belong to section 0:
//!
//! ```text
//! ---URL_INDEX:0---
//! Leica M6 Black 250,000円
//! ---URL_INDEX:1---
//! Rolex Datejust 900,000円
//! ```

use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::clock::Clock;
use crate::models::{CommandSpec, Item, Snapshot};
use crate::services::fetch::{FetchError, Fetcher};

/// Largest stdout accepted from a scraper.
pub const MAX_OUTPUT_BYTES: usize = 1_000_000;

const MIN_LINE_CHARS: usize = 10;
const MIN_NAME_CHARS: usize = 4;
const MAX_NAME_CHARS: usize = 200;
const PRICE_RANGE: std::ops::RangeInclusive<u64> = 100..=10_000_000;

const SKIP_KEYWORDS: &[&str] = &[
    "info",
    "error",
    "debug",
    "warning",
    "log",
    "traceback",
    "selenium",
    "driver",
    "browser",
    "playwright",
];

static PRICE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [r"([0-9,]+)\s*円", r"[¥￥]\s*([0-9,]+)", r"(\d{4,})\s*円"]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

const SECTION_PREFIX: &str = "---URL_INDEX:";

static SECTION_MARKER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^---URL_INDEX:(\d+)---").ok());

static MULTI_SPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[\s|│]+").ok());

/// First plausible yen price in `text`.
pub fn extract_price(text: &str) -> Option<u64> {
    PRICE_PATTERNS.iter().find_map(|pattern| {
        let caps = pattern.captures(text)?;
        let digits: String = caps.get(1)?.as_str().chars().filter(|c| *c != ',').collect();
        digits.parse().ok().filter(|p| PRICE_RANGE.contains(p))
    })
}

/// `text` with every price removed and separators collapsed.
fn extract_name(text: &str) -> String {
    let mut name = text.to_string();
    for pattern in PRICE_PATTERNS.iter() {
        name = pattern.replace_all(&name, "").into_owned();
    }
    match MULTI_SPACE.as_ref() {
        Some(re) => re.replace_all(&name, " ").trim().to_string(),
        None => name.split_whitespace().collect::<Vec<_>>().join(" "),
    }
}

fn is_noise(text: &str) -> bool {
    let lower = text.to_lowercase();
    SKIP_KEYWORDS.iter().any(|word| lower.contains(word))
}

/// Section number of a `---URL_INDEX:n---` marker line.
fn section_marker(line: &str) -> Option<u32> {
    SECTION_MARKER
        .as_ref()?
        .captures(line)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

/// Parse one stdout line into an item.
pub fn parse_line(line: &str) -> Option<Item> {
    let line = line.trim();
    if line.chars().count() < MIN_LINE_CHARS || line.starts_with(SECTION_PREFIX) {
        return None;
    }

    let (head, image) = match line.split_once("||") {
        Some((head, rest)) => (head, rest.split("||").next().map(str::trim)),
        None => (line, None),
    };
    if is_noise(head) {
        return None;
    }

    let price = extract_price(head)?;
    let name = extract_name(head);
    if name.chars().count() < MIN_NAME_CHARS {
        return None;
    }

    Some(Item {
        name: name.chars().take(MAX_NAME_CHARS).collect(),
        price: Some(price),
        status: None,
        image_url: image.filter(|s| !s.is_empty()).map(str::to_string),
        link: None,
    })
}

/// Parse a whole scraper output, keeping only `section` when given.
pub fn parse_output(output: &str, section: Option<u32>) -> Result<Vec<Item>, FetchError> {
    if output.len() > MAX_OUTPUT_BYTES {
        return Err(FetchError::Invalid(format!(
            "output of {} bytes exceeds {} bytes",
            output.len(),
            MAX_OUTPUT_BYTES
        )));
    }

    let mut current = 0;
    let mut items = Vec::new();
    for line in output.lines().map(str::trim) {
        if line.starts_with(SECTION_PREFIX) {
            match section_marker(line) {
                Some(index) => current = index,
                None => log::debug!("Ignoring malformed section marker {line:?}"),
            }
            continue;
        }
        if section.is_some_and(|wanted| wanted != current) {
            continue;
        }
        items.extend(parse_line(line));
    }
    Ok(items)
}

/// Fetcher that runs an external scraper program.
pub struct CommandFetcher {
    spec: CommandSpec,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl CommandFetcher {
    pub fn new(spec: CommandSpec, clock: Arc<dyn Clock>, default_timeout: Duration) -> Self {
        let timeout = spec
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(default_timeout);
        Self {
            spec,
            clock,
            timeout,
        }
    }

    async fn run(&self) -> Result<String, FetchError> {
        let mut command = Command::new(&self.spec.program);
        command
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.workdir {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| FetchError::Spawn {
            program: self.spec.program.clone(),
            source,
        })?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))?
            .map_err(|e| FetchError::Command(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.trim().lines().last().unwrap_or_default().chars().take(200).collect();
            return Err(FetchError::Command(format!("{}: {}", output.status, tail)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Fetcher for CommandFetcher {
    async fn fetch(&self) -> Result<Snapshot, FetchError> {
        let stdout = self.run().await?;
        let items = parse_output(&stdout, self.spec.url_index)?;
        if items.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(Snapshot::new(self.clock.now(), items))
    }
}
