//! URL admission filter
//!
//! Turns the raw `urls` value of a request body into an ordered, de-duplicated
//! list of [`ValidUrl`]s. Validation is purely syntactic: an entry is kept when
//! it parses as an absolute `http`/`https` URL with a host. Anything else is
//! dropped without an individual error. No DNS lookups happen here.

use std::collections::HashSet;
use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Default ceiling on URLs admitted from one request
pub const DEFAULT_MAX_BATCH_URLS: usize = 200;

/// Admission errors. Both abort the whole request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Invalid input: urls must be an array of strings")]
    InvalidInput,

    #[error("Too many URLs: {count} (max {max})")]
    BatchTooLarge { count: usize, max: usize },
}

/// A syntactically well-formed absolute http(s) URL.
///
/// Keeps the caller's (trimmed) spelling for echoing back alongside the
/// parsed form used for fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidUrl {
    raw: String,
    parsed: Url,
}

impl ValidUrl {
    /// Parse a candidate string. Returns `None` for anything that is not an
    /// absolute http(s) URL with a host.
    pub fn parse(candidate: &str) -> Option<Self> {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            return None;
        }

        let parsed = Url::parse(trimmed).ok()?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return None;
        }
        match parsed.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return None,
        }

        Some(Self {
            raw: trimmed.to_string(),
            parsed,
        })
    }

    /// The URL as submitted (whitespace trimmed)
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The parsed URL
    pub fn url(&self) -> &Url {
        &self.parsed
    }
}

impl fmt::Display for ValidUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for ValidUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

/// Filter a raw `urls` value into admitted URLs.
///
/// - `None` or a non-array value fails with [`AdmissionError::InvalidInput`].
/// - Non-string entries and unparseable strings are dropped.
/// - Duplicates (by normalized URL) keep their first occurrence.
/// - An empty result is success.
/// - More than `max_urls` admitted entries fails with
///   [`AdmissionError::BatchTooLarge`].
pub fn admit_urls(raw: Option<&Value>, max_urls: usize) -> Result<Vec<ValidUrl>, AdmissionError> {
    let entries = raw
        .and_then(Value::as_array)
        .ok_or(AdmissionError::InvalidInput)?;

    let candidates = entries.iter().filter_map(Value::as_str);
    let admitted = filter_candidates(candidates);

    if admitted.len() > max_urls {
        return Err(AdmissionError::BatchTooLarge {
            count: admitted.len(),
            max: max_urls,
        });
    }

    Ok(admitted)
}

/// Filter already-typed candidate strings (CLI path). Never fails.
pub fn filter_candidates<'a, I>(candidates: I) -> Vec<ValidUrl>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut admitted = Vec::new();

    for candidate in candidates {
        let Some(url) = ValidUrl::parse(candidate) else {
            tracing::debug!(target: "http", "dropping invalid url candidate");
            continue;
        };
        if seen.insert(url.parsed.as_str().to_string()) {
            admitted.push(url);
        }
    }

    admitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn admit(value: Value) -> Result<Vec<String>, AdmissionError> {
        admit_urls(Some(&value), DEFAULT_MAX_BATCH_URLS)
            .map(|urls| urls.iter().map(|u| u.as_str().to_string()).collect())
    }

    #[test]
    fn test_missing_urls_is_invalid_input() {
        assert_eq!(
            admit_urls(None, DEFAULT_MAX_BATCH_URLS),
            Err(AdmissionError::InvalidInput)
        );
    }

    #[test]
    fn test_non_array_is_invalid_input() {
        assert_eq!(admit(json!("https://example.com")), Err(AdmissionError::InvalidInput));
        assert_eq!(admit(json!({"0": "https://example.com"})), Err(AdmissionError::InvalidInput));
        assert_eq!(admit(json!(null)), Err(AdmissionError::InvalidInput));
        assert_eq!(admit(json!(42)), Err(AdmissionError::InvalidInput));
    }

    #[test]
    fn test_empty_array_is_success() {
        assert_eq!(admit(json!([])), Ok(vec![]));
    }

    #[test]
    fn test_keeps_http_and_https() {
        let urls = admit(json!(["https://example.com", "http://example.org/path?q=1"])).unwrap();
        assert_eq!(urls, vec!["https://example.com", "http://example.org/path?q=1"]);
    }

    #[test]
    fn test_drops_malformed_and_foreign_schemes() {
        let urls = admit(json!([
            "not a url",
            "ftp://example.com/file",
            "https://ok.example.com",
            "javascript:alert(1)",
            "file:///etc/passwd",
            "mailto:someone@example.com",
            "",
            "http://",
            "/relative/path"
        ]))
        .unwrap();
        assert_eq!(urls, vec!["https://ok.example.com"]);
    }

    #[test]
    fn test_drops_non_string_entries() {
        let urls = admit(json!([1, null, {"url": "https://a.com"}, "https://b.com", ["https://c.com"]]))
            .unwrap();
        assert_eq!(urls, vec!["https://b.com"]);
    }

    #[test]
    fn test_preserves_order() {
        let urls = admit(json!(["https://c.com", "bogus", "https://a.com", "https://b.com"])).unwrap();
        assert_eq!(urls, vec!["https://c.com", "https://a.com", "https://b.com"]);
    }

    #[test]
    fn test_deduplicates_keeping_first() {
        let urls = admit(json!([
            "https://a.com",
            "https://b.com",
            "https://a.com/",
            " https://b.com "
        ]))
        .unwrap();
        assert_eq!(urls, vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn test_trims_whitespace() {
        let urls = admit(json!(["  https://example.com/page  "])).unwrap();
        assert_eq!(urls, vec!["https://example.com/page"]);
    }

    #[test]
    fn test_batch_too_large() {
        let many: Vec<String> = (0..5).map(|i| format!("https://host{}.example.com", i)).collect();
        let value = json!(many);
        assert_eq!(
            admit_urls(Some(&value), 4),
            Err(AdmissionError::BatchTooLarge { count: 5, max: 4 })
        );
        assert_eq!(admit_urls(Some(&value), 5).unwrap().len(), 5);
    }

    #[test]
    fn test_ceiling_counts_only_admitted_entries() {
        let value = json!(["bogus", "also bogus", "https://a.com"]);
        assert_eq!(admit_urls(Some(&value), 1).unwrap().len(), 1);
    }

    #[test]
    fn test_valid_url_serializes_as_string() {
        let url = ValidUrl::parse("https://example.com/x").unwrap();
        assert_eq!(serde_json::to_value(&url).unwrap(), json!("https://example.com/x"));
        assert_eq!(url.to_string(), "https://example.com/x");
        assert_eq!(url.url().host_str(), Some("example.com"));
    }

    #[test]
    fn test_filter_candidates() {
        let urls = filter_candidates(["https://a.com", "nope", "https://a.com"]);
        assert_eq!(urls.len(), 1);
    }
}
