// src/models/item.rs

//! Listing items and the snapshots built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single listing as returned by a fetcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    /// Listing title
    pub name: String,

    /// Price in yen, if shown
    #[serde(default)]
    pub price: Option<u64>,

    /// Availability text (sold out, reserved, ...)
    #[serde(default)]
    pub status: Option<String>,

    /// Product image URL
    #[serde(default)]
    pub image_url: Option<String>,

    /// Product page URL
    #[serde(default)]
    pub link: Option<String>,
}

impl Item {
    /// Create an item with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            price: None,
            status: None,
            image_url: None,
            link: None,
        }
    }

    /// Builder-style price setter.
    pub fn with_price(mut self, price: u64) -> Self {
        self.price = Some(price);
        self
    }

    /// Builder-style image setter.
    pub fn with_image(mut self, url: impl Into<String>) -> Self {
        self.image_url = Some(url.into());
        self
    }

    /// Builder-style status setter.
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    /// Human-readable price, e.g. `12,800円`.
    pub fn price_label(&self) -> String {
        match self.price {
            Some(price) => format!("{}円", group_thousands(price)),
            None => "price on request".to_string(),
        }
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// Fresh content from one fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the fetch completed
    pub taken_at: DateTime<Utc>,

    /// Items in page order
    pub items: Vec<Item>,
}

impl Snapshot {
    pub fn new(taken_at: DateTime<Utc>, items: Vec<Item>) -> Self {
        Self { taken_at, items }
    }
}

/// Hashed form of an item, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemRecord {
    /// Stable identity hash
    pub identity: String,

    /// Hash over the fields whose change is worth an alert
    pub content: String,

    /// Item name, kept for diagnostics
    pub name: String,
}

/// Last-known state of a source; the baseline for the next diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub source_id: String,
    pub taken_at: DateTime<Utc>,
    pub records: Vec<ItemRecord>,
}

impl StoredSnapshot {
    /// Empty baseline used on cold start.
    pub fn empty(source_id: impl Into<String>, taken_at: DateTime<Utc>) -> Self {
        Self {
            source_id: source_id.into(),
            taken_at,
            records: Vec::new(),
        }
    }

    /// Number of items in the snapshot.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Why an item was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Identity not present in the previous snapshot
    Added,
    /// Identity present but content hash differs
    Changed,
}

/// An item reported by the change detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedItem {
    pub identity: String,
    pub kind: ChangeKind,
    pub item: Item,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_label() {
        assert_eq!(Item::named("A").with_price(12800).price_label(), "12,800円");
        assert_eq!(Item::named("A").with_price(950).price_label(), "950円");
        assert_eq!(
            Item::named("A").with_price(1_234_567).price_label(),
            "1,234,567円"
        );
        assert_eq!(Item::named("A").price_label(), "price on request");
    }

    #[test]
    fn test_stored_snapshot_roundtrip_keeps_order() {
        let snapshot = StoredSnapshot {
            source_id: "shop".into(),
            taken_at: Utc::now(),
            records: vec![
                ItemRecord {
                    identity: "b".into(),
                    content: "1".into(),
                    name: "B".into(),
                },
                ItemRecord {
                    identity: "a".into(),
                    content: "2".into(),
                    name: "A".into(),
                },
            ],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: StoredSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.records, snapshot.records);
    }
}
