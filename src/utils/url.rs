// src/utils/url.rs

//! URL manipulation utilities.

use url::Url;

/// Resolve a potentially relative URL against a base URL.
///
/// Returns `href` unchanged when either side cannot be parsed.
///
/// # Examples
/// ```
/// use shopwatch::utils::url::resolve;
///
/// assert_eq!(
///     resolve("https://example.com/path/", "page.html"),
///     "https://example.com/path/page.html"
/// );
/// ```
pub fn resolve(base: &str, href: &str) -> String {
    let href = href.trim();
    if let Ok(absolute) = Url::parse(href) {
        return absolute.to_string();
    }
    Url::parse(base)
        .and_then(|base| base.join(href))
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Canonical form of an image URL used for item identity.
///
/// Query string and fragment are dropped (resize and cache-busting
/// parameters change between fetches); scheme and host are lowercased by
/// the parser. Unparseable input falls back to the text before `?`/`#`.
///
/// # Examples
/// ```
/// use shopwatch::utils::url::canonical_url;
///
/// assert_eq!(
///     canonical_url("HTTPS://Img.Example.com/a/B.jpg?w=300#top"),
///     Some("https://img.example.com/a/B.jpg".to_string())
/// );
/// ```
pub fn canonical_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_query(None);
            url.set_fragment(None);
            Some(url.to_string())
        }
        Err(_) => {
            let end = raw.find(['?', '#']).unwrap_or(raw.len());
            let stripped = raw[..end].trim();
            (!stripped.is_empty()).then(|| stripped.to_string())
        }
    }
}
