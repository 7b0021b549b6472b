//! Page retrieval with outbound-request protection
//!
//! Retrieves the initial HTML response of one URL:
//! - HTTP/HTTPS only, every hop checked by [`SsrfGuard`]
//! - Host resolved once per hop, every address validated, connection pinned
//! - Redirects followed manually up to a bounded depth
//! - Non-success status is an error
//! - Body streamed with a size cap; no subresources are fetched

pub mod ssrf;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use reqwest::{header, Client, StatusCode};
use thiserror::Error;
use url::Url;

pub use ssrf::{SsrfConfig, SsrfError, SsrfGuard};

/// Default per-fetch timeout in milliseconds (10s)
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

/// Maximum per-fetch timeout in milliseconds (2 minutes)
pub const MAX_FETCH_TIMEOUT_MS: u64 = 120_000;

/// Default redirect depth
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Default maximum response body (2MB)
pub const DEFAULT_MAX_BODY_BYTES: u64 = 2 * 1024 * 1024;

/// Maximum URL length (2KB)
pub const MAX_URL_LENGTH: usize = 2048;

const USER_AGENT: &str = concat!("metafetch/", env!("CARGO_PKG_VERSION"));

/// Errors that can occur while retrieving a page
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("{0}")]
    Blocked(#[from] SsrfError),

    #[error("URL too long: {size} chars (max {max})")]
    UrlTooLong { size: usize, max: usize },

    #[error("Invalid redirect target: {0}")]
    InvalidRedirect(String),

    #[error("Too many redirects (max {0})")]
    TooManyRedirects(usize),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    #[error("Request failed: {0}")]
    HttpRequest(String),

    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("HTTP error status: {0}")]
    Status(u16),

    #[error("Response too large: {size} bytes (max {max})")]
    ResponseTooLarge { size: u64, max: u64 },

    #[error("Stream read error: {0}")]
    StreamRead(String),
}

/// A retrieved page
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL of the final response after redirects
    pub final_url: Url,

    /// Content-Type header, if present
    pub content_type: Option<String>,

    /// Raw body bytes
    pub body: Vec<u8>,
}

/// Fetcher configuration
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-call timeout covering every hop and the body (default: 10s)
    pub timeout_ms: u64,

    /// Redirects followed before giving up (default: 5)
    pub max_redirects: usize,

    /// Body size cap in bytes (default: 2MB)
    pub max_body_bytes: u64,

    /// Outbound-request guard settings
    pub ssrf: SsrfConfig,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            ssrf: SsrfConfig::default(),
        }
    }
}

impl FetchConfig {
    /// Set the per-call timeout (capped at [`MAX_FETCH_TIMEOUT_MS`])
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms.min(MAX_FETCH_TIMEOUT_MS);
        self
    }

    /// Set the redirect depth
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Set the body size cap
    pub fn with_max_body_bytes(mut self, max_body_bytes: u64) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Allow loopback and private targets
    pub fn allow_private_networks(mut self) -> Self {
        self.ssrf.allow_private_networks = true;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.min(MAX_FETCH_TIMEOUT_MS))
    }
}

/// Page fetcher. Cheap to clone; clones share the resolver.
#[derive(Clone)]
pub struct PageFetcher {
    config: Arc<FetchConfig>,
    resolver: Arc<TokioAsyncResolver>,
}

impl PageFetcher {
    /// Create a new fetcher with the given configuration
    pub fn new(config: FetchConfig) -> Self {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        Self {
            config: Arc::new(config),
            resolver: Arc::new(resolver),
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Retrieve `url`, following redirects, within the configured timeout.
    ///
    /// Exceeding the timeout cancels only this call.
    pub async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.fetch_following_redirects(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(timeout.as_millis() as u64)),
        }
    }

    async fn fetch_following_redirects(&self, start: &Url) -> Result<FetchedPage, FetchError> {
        let mut current = start.clone();
        let mut hops = 0usize;

        loop {
            let response = self.send_once(&current).await?;
            let status = response.status();

            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                if hops >= self.config.max_redirects {
                    return Err(FetchError::TooManyRedirects(self.config.max_redirects));
                }
                current = redirect_target(&current, &response)?;
                hops += 1;
                tracing::debug!(target: "fetch", url = %current, hop = hops, "following redirect");
                continue;
            }

            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }

            if let Some(length) = response.content_length() {
                if length > self.config.max_body_bytes {
                    return Err(FetchError::ResponseTooLarge {
                        size: length,
                        max: self.config.max_body_bytes,
                    });
                }
            }

            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            let body = read_body_with_limit(response, self.config.max_body_bytes).await?;

            return Ok(FetchedPage {
                final_url: current,
                content_type,
                body,
            });
        }
    }

    /// Issue one GET without following redirects.
    async fn send_once(&self, url: &Url) -> Result<reqwest::Response, FetchError> {
        if url.as_str().len() > MAX_URL_LENGTH {
            return Err(FetchError::UrlTooLong {
                size: url.as_str().len(),
                max: MAX_URL_LENGTH,
            });
        }

        SsrfGuard::validate_url(url, &self.config.ssrf)?;

        // No client-level timeout: the whole call is bounded in `fetch`.
        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none());

        if !self.config.ssrf.allow_private_networks {
            if let Some(host) = url.host_str() {
                if host.parse::<IpAddr>().is_err() && !host.starts_with('[') {
                    let port = url.port_or_known_default().unwrap_or(80);
                    let ip = self.resolve_and_validate(host).await?;
                    builder = builder.resolve(host, SocketAddr::new(ip, port));
                    tracing::debug!(target: "fetch", host = %host, resolved_ip = %ip, "pinned validated address");
                }
            }
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::HttpRequest(format!("failed to create HTTP client: {}", e)))?;

        client
            .get(url.clone())
            .header(header::ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.5")
            .send()
            .await
            .map_err(|e| FetchError::HttpRequest(describe_reqwest_error(&e)))
    }

    /// Resolve `host` and validate every returned address.
    ///
    /// Returns the first address, to be pinned for the request.
    async fn resolve_and_validate(&self, host: &str) -> Result<IpAddr, FetchError> {
        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| FetchError::DnsResolution(format!("{}: {}", host, e)))?;

        let mut pinned = None;
        for ip in lookup.iter() {
            SsrfGuard::validate_resolved_ip(&ip, host, &self.config.ssrf)?;
            pinned.get_or_insert(ip);
        }

        pinned.ok_or_else(|| FetchError::DnsResolution(format!("no addresses returned for {}", host)))
    }
}

fn redirect_target(current: &Url, response: &reqwest::Response) -> Result<Url, FetchError> {
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| FetchError::InvalidRedirect("missing Location header".to_string()))?;

    current
        .join(location)
        .map_err(|e| FetchError::InvalidRedirect(format!("{}: {}", location, e)))
}

async fn read_body_with_limit(
    response: reqwest::Response,
    max_size: u64,
) -> Result<Vec<u8>, FetchError> {
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::StreamRead(e.to_string()))?;

        let new_size = body.len() as u64 + chunk.len() as u64;
        if new_size > max_size {
            return Err(FetchError::ResponseTooLarge {
                size: new_size,
                max: max_size,
            });
        }
        body.extend_from_slice(&chunk);
    }

    Ok(body)
}

fn describe_reqwest_error(e: &reqwest::Error) -> String {
    if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}
