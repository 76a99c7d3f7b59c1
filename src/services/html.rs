// src/services/html.rs

//! Selector-driven listing page adapter.

use std::sync::Arc;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::{HtmlSpec, Item, Snapshot};
use crate::services::command::extract_price;
use crate::services::fetch::{FetchError, Fetcher};
use crate::utils::http::fetch_text;
use crate::utils::url::resolve;

/// Pre-parsed selectors of one [`HtmlSpec`].
#[derive(Debug, Clone)]
struct Selectors {
    item: Selector,
    name: Selector,
    price: Option<Selector>,
    status: Option<Selector>,
    image: Option<Selector>,
    link: Option<Selector>,
}

impl Selectors {
    fn parse(spec: &HtmlSpec) -> Result<Self> {
        let optional = |s: &Option<String>| s.as_deref().map(parse_selector).transpose();
        Ok(Self {
            item: parse_selector(&spec.item)?,
            name: parse_selector(&spec.name)?,
            price: optional(&spec.price)?,
            status: optional(&spec.status)?,
            image: optional(&spec.image)?,
            link: optional(&spec.link)?,
        })
    }
}

fn parse_selector(s: &str) -> Result<Selector> {
    Selector::parse(s).map_err(|e| AppError::validation(format!("invalid selector {s:?}: {e:?}")))
}

fn text_of(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Fetcher that downloads a page and extracts items with CSS selectors.
pub struct HtmlFetcher {
    spec: HtmlSpec,
    selectors: Selectors,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl HtmlFetcher {
    pub fn new(spec: HtmlSpec, client: reqwest::Client, clock: Arc<dyn Clock>) -> Result<Self> {
        let selectors = Selectors::parse(&spec)?;
        Ok(Self {
            spec,
            selectors,
            client,
            clock,
        })
    }

    /// Extract items from a page body.
    pub fn parse_items(&self, html: &str) -> Vec<Item> {
        let document = Html::parse_document(html);
        document
            .select(&self.selectors.item)
            .filter_map(|element| self.parse_item(element))
            .collect()
    }

    fn parse_item(&self, element: ElementRef<'_>) -> Option<Item> {
        let sel = &self.selectors;
        let name = element.select(&sel.name).next().map(text_of)?;
        if name.is_empty() {
            return None;
        }

        let price = sel
            .price
            .as_ref()
            .and_then(|s| element.select(s).next())
            .map(text_of)
            .and_then(|text| extract_price(&text).or_else(|| digits_only(&text)));
        let status = sel
            .status
            .as_ref()
            .and_then(|s| element.select(s).next())
            .map(text_of)
            .filter(|s| !s.is_empty());
        let image_url = sel
            .image
            .as_ref()
            .and_then(|s| element.select(s).next())
            .and_then(|e| e.value().attr(&self.spec.image_attr))
            .map(|src| resolve(&self.spec.url, src));
        let link = sel
            .link
            .as_ref()
            .and_then(|s| element.select(s).next())
            .and_then(|e| e.value().attr(&self.spec.link_attr))
            .map(|href| resolve(&self.spec.url, href));

        Some(Item {
            name,
            price,
            status,
            image_url,
            link,
        })
    }
}

/// Price written without a currency marker, e.g. `"12,800"`.
fn digits_only(text: &str) -> Option<u64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok().filter(|p| (100..=10_000_000).contains(p))
}

#[async_trait]
impl Fetcher for HtmlFetcher {
    async fn fetch(&self) -> std::result::Result<Snapshot, FetchError> {
        let body = fetch_text(&self.client, &self.spec.url).await?;
        let items = self.parse_items(&body);
        if items.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(Snapshot::new(self.clock.now(), items))
    }
}
