//! Metadata extraction
//!
//! Fetches one URL and pulls three signals out of the static markup:
//! - `title`: text of the first `<title>` element
//! - `description`: `content` of `<meta name="description">`
//! - `image`: `content` of `<meta property="og:image">`
//!
//! Absent signals become empty strings. [`MetadataExtractor::extract`] turns
//! every failure into a [`BatchEntry::Failure`] value, so callers never see an
//! `Err` for a single URL.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::admission::ValidUrl;
use crate::fetch::{FetchError, FetchedPage, PageFetcher};

static TITLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex"));
// Quoted attribute values may contain `>`.
static META_TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<meta\b((?:[^>"']|"[^"]*"|'[^']*')*)>"#).expect("meta tag regex")
});
static ATTRIBUTE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+))"#)
        .expect("attribute regex")
});
static SCRIPT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script[^>]*>.*?</script>").expect("script regex"));
static COMMENT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").expect("comment regex"));
static WHITESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex"));
static ENTITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(?:#([0-9]{1,7})|#[xX]([0-9A-Fa-f]{1,6})|([A-Za-z][A-Za-z0-9]{1,31}));")
        .expect("entity regex")
});

/// Errors from a single extraction. Never escape [`MetadataExtractor::extract`].
#[derive(Error, Debug, Clone)]
pub enum ExtractError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Content is not HTML: {0}")]
    NotHtml(String),
}

/// The three signals parsed from one page
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PageMetadata {
    pub title: String,
    pub description: String,
    pub image: String,
}

/// Successful extraction for one URL. Every field is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataRecord {
    pub url: ValidUrl,
    pub title: String,
    pub description: String,
    pub image: String,
}

/// Failed extraction for one URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionFailure {
    pub url: ValidUrl,
    pub error: String,
}

/// Exactly one outcome per URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Success(MetadataRecord),
    Failure(ExtractionFailure),
}

impl BatchEntry {
    pub fn success(url: ValidUrl, metadata: PageMetadata) -> Self {
        Self::Success(MetadataRecord {
            url,
            title: metadata.title,
            description: metadata.description,
            image: metadata.image,
        })
    }

    pub fn failure(url: ValidUrl, error: impl Into<String>) -> Self {
        Self::Failure(ExtractionFailure {
            url,
            error: error.into(),
        })
    }

    pub fn url(&self) -> &ValidUrl {
        match self {
            Self::Success(record) => &record.url,
            Self::Failure(failure) => &failure.url,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Fetch-and-parse for single URLs. Cheap to clone.
#[derive(Clone)]
pub struct MetadataExtractor {
    fetcher: PageFetcher,
}

impl MetadataExtractor {
    pub fn new(fetcher: PageFetcher) -> Self {
        Self { fetcher }
    }

    /// Extract metadata for `url`. Always returns an entry for `url`.
    pub async fn extract(&self, url: &ValidUrl) -> BatchEntry {
        match self.try_extract(url).await {
            Ok(metadata) => {
                tracing::debug!(target: "fetch", url = %url, "extracted metadata");
                BatchEntry::success(url.clone(), metadata)
            }
            Err(e) => {
                tracing::debug!(target: "fetch", url = %url, error = %e, "extraction failed");
                BatchEntry::failure(url.clone(), e.to_string())
            }
        }
    }

    async fn try_extract(&self, url: &ValidUrl) -> Result<PageMetadata, ExtractError> {
        let page = self.fetcher.fetch(url.url()).await?;
        let html = decode_page(&page)?;
        Ok(parse_metadata(&html))
    }
}

/// Decode the body of an HTML page. Bytes that are not UTF-8 are replaced.
fn decode_page(page: &FetchedPage) -> Result<String, ExtractError> {
    if let Some(content_type) = page.content_type.as_deref() {
        if !is_html_content(content_type) {
            return Err(ExtractError::NotHtml(content_type.to_string()));
        }
    }
    Ok(String::from_utf8_lossy(&page.body).into_owned())
}

fn is_html_content(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("text/") || ct.starts_with("application/xhtml+xml")
}

/// Parse title, description and preview image out of raw markup.
pub fn parse_metadata(html: &str) -> PageMetadata {
    let cleaned = COMMENT_REGEX.replace_all(html, "");
    let cleaned = SCRIPT_REGEX.replace_all(&cleaned, "");

    let title = TITLE_REGEX
        .captures(&cleaned)
        .and_then(|caps| caps.get(1))
        .map(|m| normalize_text(m.as_str()))
        .unwrap_or_default();

    let mut description = None;
    let mut image = None;

    for tag in META_TAG_REGEX.captures_iter(&cleaned) {
        let Some(attrs) = tag.get(1).map(|m| parse_attributes(m.as_str())) else {
            continue;
        };
        let content = attr(&attrs, "content");

        if description.is_none() && attr_eq(&attrs, "name", "description") {
            description = content.map(normalize_text);
        } else if image.is_none() && attr_eq(&attrs, "property", "og:image") {
            image = content.map(|c| decode_html_entities(c.trim()));
        }

        if description.is_some() && image.is_some() {
            break;
        }
    }

    PageMetadata {
        title,
        description: description.unwrap_or_default(),
        image: image.unwrap_or_default(),
    }
}

fn parse_attributes(raw: &str) -> Vec<(String, &str)> {
    ATTRIBUTE_REGEX
        .captures_iter(raw)
        .filter_map(|caps| {
            let name = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps.get(2).or(caps.get(3)).or(caps.get(4))?.as_str();
            Some((name, value))
        })
        .collect()
}

fn attr<'a>(attrs: &[(String, &'a str)], name: &str) -> Option<&'a str> {
    attrs.iter().find(|(n, _)| n == name).map(|(_, v)| *v)
}

fn attr_eq(attrs: &[(String, &str)], name: &str, expected: &str) -> bool {
    attr(attrs, name).is_some_and(|v| v.trim().eq_ignore_ascii_case(expected))
}

fn normalize_text(raw: &str) -> String {
    let decoded = decode_html_entities(raw);
    WHITESPACE_REGEX.replace_all(&decoded, " ").trim().to_string()
}

/// Decode numeric character references and the common named entities in a
/// single pass. Unknown names are left as written.
fn decode_html_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    ENTITY_REGEX
        .replace_all(text, |caps: &regex::Captures| {
            let decoded = if let Some(dec) = caps.get(1) {
                dec.as_str().parse::<u32>().ok().map(numeric_reference)
            } else if let Some(hex) = caps.get(2) {
                u32::from_str_radix(hex.as_str(), 16).ok().map(numeric_reference)
            } else {
                caps.get(3).and_then(|name| named_entity(name.as_str()))
            };
            match decoded {
                Some(c) => c.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// NUL, surrogates and out-of-range code points become U+FFFD.
fn numeric_reference(code: u32) -> char {
    if code == 0 {
        return char::REPLACEMENT_CHARACTER;
    }
    char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER)
}

fn named_entity(name: &str) -> Option<char> {
    let c = match name {
        "amp" | "AMP" => '&',
        "lt" | "LT" => '<',
        "gt" | "GT" => '>',
        "quot" | "QUOT" => '"',
        "apos" => '\'',
        "nbsp" => '\u{a0}',
        "ensp" => '\u{2002}',
        "emsp" => '\u{2003}',
        "thinsp" => '\u{2009}',
        "ndash" => '\u{2013}',
        "mdash" => '\u{2014}',
        "lsquo" => '\u{2018}',
        "rsquo" => '\u{2019}',
        "sbquo" => '\u{201a}',
        "ldquo" => '\u{201c}',
        "rdquo" => '\u{201d}',
        "bdquo" => '\u{201e}',
        "laquo" => '\u{ab}',
        "raquo" => '\u{bb}',
        "lsaquo" => '\u{2039}',
        "rsaquo" => '\u{203a}',
        "hellip" => '\u{2026}',
        "bull" => '\u{2022}',
        "middot" => '\u{b7}',
        "dagger" => '\u{2020}',
        "Dagger" => '\u{2021}',
        "prime" => '\u{2032}',
        "copy" => '\u{a9}',
        "reg" => '\u{ae}',
        "trade" => '\u{2122}',
        "deg" => '\u{b0}',
        "plusmn" => '\u{b1}',
        "times" => '\u{d7}',
        "divide" => '\u{f7}',
        "frac12" => '\u{bd}',
        "frac14" => '\u{bc}',
        "frac34" => '\u{be}',
        "sect" => '\u{a7}',
        "para" => '\u{b6}',
        "cent" => '\u{a2}',
        "pound" => '\u{a3}',
        "yen" => '\u{a5}',
        "euro" => '\u{20ac}',
        "iexcl" => '\u{a1}',
        "iquest" => '\u{bf}',
        "larr" => '\u{2190}',
        "rarr" => '\u{2192}',
        "uarr" => '\u{2191}',
        "darr" => '\u{2193}',
        "harr" => '\u{2194}',
        "hearts" => '\u{2665}',
        "star" => '\u{2606}',
        "check" => '\u{2713}',
        "agrave" => '\u{e0}',
        "aacute" => '\u{e1}',
        "acirc" => '\u{e2}',
        "atilde" => '\u{e3}',
        "auml" => '\u{e4}',
        "aring" => '\u{e5}',
        "aelig" => '\u{e6}',
        "ccedil" => '\u{e7}',
        "egrave" => '\u{e8}',
        "eacute" => '\u{e9}',
        "ecirc" => '\u{ea}',
        "euml" => '\u{eb}',
        "igrave" => '\u{ec}',
        "iacute" => '\u{ed}',
        "icirc" => '\u{ee}',
        "iuml" => '\u{ef}',
        "ntilde" => '\u{f1}',
        "ograve" => '\u{f2}',
        "oacute" => '\u{f3}',
        "ocirc" => '\u{f4}',
        "otilde" => '\u{f5}',
        "ouml" => '\u{f6}',
        "oslash" => '\u{f8}',
        "ugrave" => '\u{f9}',
        "uacute" => '\u{fa}',
        "ucirc" => '\u{fb}',
        "uuml" => '\u{fc}',
        "yacute" => '\u{fd}',
        "yuml" => '\u{ff}',
        "szlig" => '\u{df}',
        "Agrave" => '\u{c0}',
        "Aacute" => '\u{c1}',
        "Auml" => '\u{c4}',
        "Aring" => '\u{c5}',
        "Ccedil" => '\u{c7}',
        "Eacute" => '\u{c9}',
        "Ntilde" => '\u{d1}',
        "Ouml" => '\u{d6}',
        "Oslash" => '\u{d8}',
        "Uuml" => '\u{dc}',
        _ => return None,
    };
    Some(c)
}
