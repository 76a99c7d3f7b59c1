// src/pipeline/normalize.rs

//! Text normalization and item hashing.

use std::collections::HashMap;
use std::sync::Mutex;

use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::models::Item;
use crate::utils::url::canonical_url;

/// Default number of memoized normalizations.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Lowercase, keep Unicode words only, join them with single spaces.
///
/// Punctuation and runs of whitespace disappear, so `"Leica  M6 (Black)"`
/// and `"leica m6 black"` normalize identically.
pub fn normalize_text(text: &str) -> String {
    let lower = text.to_lowercase();
    lower.unicode_words().collect::<Vec<_>>().join(" ")
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"\x1f");
        }
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Memoizing normalizer and hasher.
///
/// The cache is a pure memo: when it reaches capacity it is cleared and
/// refilled, so its size stays bounded over months of uptime.
#[derive(Debug)]
pub struct Normalizer {
    cache: Mutex<HashMap<String, String>>,
    capacity: usize,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Memoized [`normalize_text`].
    pub fn normalize(&self, text: &str) -> String {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = cache.get(text) {
            return hit.clone();
        }
        let normalized = normalize_text(text);
        if cache.len() >= self.capacity {
            cache.clear();
        }
        cache.insert(text.to_string(), normalized.clone());
        normalized
    }

    /// Entries currently memoized.
    pub fn cached(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Normalized name, falling back to the trimmed raw name when nothing
    /// word-like remains.
    fn name_key(&self, name: &str) -> String {
        let normalized = self.normalize(name);
        if normalized.is_empty() {
            name.trim().to_string()
        } else {
            normalized
        }
    }

    /// Stable identity of an item within a source.
    ///
    /// The canonical image URL wins when present; otherwise the normalized
    /// name and category.
    pub fn identity(&self, item: &Item, category: &str) -> String {
        if let Some(image) = item.image_url.as_deref().and_then(canonical_url) {
            return sha256_hex(&[&image]);
        }
        let name = self.name_key(&item.name);
        let category = self.normalize(category);
        sha256_hex(&[&format!("{name}|{category}")])
    }

    /// Hash of the fields whose change is worth an alert.
    pub fn content_hash(&self, item: &Item) -> String {
        let name = self.name_key(&item.name);
        let price = item.price.map(|p| p.to_string()).unwrap_or_default();
        let status = item
            .status
            .as_deref()
            .map(|s| self.normalize(s))
            .unwrap_or_default();
        sha256_hex(&[&name, &price, &status])
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}
