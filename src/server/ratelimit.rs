//! Rate limiting middleware
//!
//! Fixed-window request budget per client IP.
//!
//! Features:
//! - One window per client key, started by the first request
//! - Per-key serialization through `DashMap` shard locks (no global lock)
//! - Rejected requests do not consume budget
//! - `x-ratelimit-*` headers on admitted responses, `Retry-After` on 429
//! - Explicit reset hooks for test harnesses

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::http::ApiError;

/// Default window length (1 minute)
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default requests per window
pub const DEFAULT_MAX_REQUESTS: u32 = 5;

/// Default cleanup interval (remove stale entries)
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Rate limit errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("Too many requests, please try again later.")]
    LimitExceeded { retry_after_secs: u64 },
}

impl RateLimitError {
    /// Seconds until the client's window resets
    pub fn retry_after_secs(&self) -> u64 {
        match self {
            RateLimitError::LimitExceeded { retry_after_secs } => *retry_after_secs,
        }
    }
}

/// Per-client window state
#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    window_start: Instant,
}

/// Outcome of an admitted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub limit: u32,
    pub remaining: u32,
}

/// Rate limiting configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Window length
    pub window: Duration,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Whether rate limiting is enabled
    pub enabled: bool,
    /// Trusted proxy headers for client IP extraction
    pub trust_proxy_headers: bool,
    /// Cleanup interval for stale entries
    pub cleanup_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
            enabled: true,
            trust_proxy_headers: false,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl RateLimitConfig {
    /// Create a builder for custom configuration
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }
}

/// Builder for RateLimitConfig
#[derive(Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    /// Set the window length
    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    /// Set the requests admitted per window
    pub fn max_requests(mut self, max_requests: u32) -> Self {
        self.config.max_requests = max_requests;
        self
    }

    /// Enable or disable rate limiting
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Trust proxy headers for client IP
    pub fn trust_proxy_headers(mut self, trust: bool) -> Self {
        self.config.trust_proxy_headers = trust;
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Build the configuration
    pub fn build(self) -> RateLimitConfig {
        self.config
    }
}

/// Rate limiter state. Clones share the window table.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<IpAddr, RateWindow>>,
    config: Arc<RateLimitConfig>,
    last_cleanup: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            windows: Arc::new(DashMap::new()),
            config: Arc::new(config),
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Count one request from `client_ip` against its window.
    pub fn check(&self, client_ip: IpAddr) -> Result<RateDecision, RateLimitError> {
        let limit = self.config.max_requests;
        if !self.config.enabled {
            return Ok(RateDecision {
                limit,
                remaining: limit,
            });
        }

        self.maybe_cleanup();

        let now = Instant::now();
        let window = self.config.window;

        // The entry guard holds the shard lock for this key only.
        let mut entry = self.windows.entry(client_ip).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });
        let state = entry.value_mut();

        if state.count == 0 || now.duration_since(state.window_start) >= window {
            state.count = 1;
            state.window_start = now;
        } else if state.count >= limit {
            let reset_in = window.saturating_sub(now.duration_since(state.window_start));
            return Err(RateLimitError::LimitExceeded {
                retry_after_secs: ceil_secs(reset_in).max(1),
            });
        } else {
            state.count += 1;
        }

        Ok(RateDecision {
            limit,
            remaining: limit.saturating_sub(state.count),
        })
    }

    /// Forget the window of one client.
    pub fn reset(&self, client_ip: &IpAddr) {
        self.windows.remove(client_ip);
    }

    /// Forget every window.
    pub fn reset_all(&self) {
        self.windows.clear();
    }

    /// Number of tracked clients
    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Drop windows that have elapsed, at most once per cleanup interval.
    fn maybe_cleanup(&self) {
        {
            let mut last_cleanup = self.last_cleanup.lock();
            if last_cleanup.elapsed() < self.config.cleanup_interval {
                return;
            }
            *last_cleanup = Instant::now();
        }
        self.purge_elapsed();
    }

    /// Drop every window that has elapsed, returning how many were removed
    pub fn purge_elapsed(&self) -> usize {
        let before = self.windows.len();
        let window = self.config.window;
        self.windows
            .retain(|_, state| state.window_start.elapsed() < window);
        let removed = before.saturating_sub(self.windows.len());
        debug!(target: "http", removed, remaining = self.windows.len(), "Rate limiter cleanup");
        removed
    }

    /// Get the configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Extract client IP from request
pub fn extract_client_ip(
    remote_addr: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_proxy: bool,
) -> Option<IpAddr> {
    if trust_proxy {
        if let Some(xff) = headers.get("x-forwarded-for") {
            if let Ok(xff_str) = xff.to_str() {
                // Leftmost entry is the original client
                if let Some(ip_str) = xff_str.split(',').next() {
                    if let Ok(ip) = ip_str.trim().parse::<IpAddr>() {
                        return Some(ip);
                    }
                }
            }
        }

        if let Some(real_ip) = headers.get("x-real-ip") {
            if let Ok(ip_str) = real_ip.to_str() {
                if let Ok(ip) = ip_str.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    remote_addr.map(|addr| addr.ip())
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let config = limiter.config();

    if !config.enabled {
        return next.run(request).await;
    }

    let remote_addr = connect_info.map(|ci| ci.0);
    let client_ip =
        match extract_client_ip(remote_addr, request.headers(), config.trust_proxy_headers) {
            Some(ip) => ip,
            None => {
                warn!(target: "http", "Rate limit: Could not determine client IP");
                return next.run(request).await;
            }
        };

    match limiter.check(client_ip) {
        Ok(decision) => {
            let mut response = next.run(request).await;
            add_rate_limit_headers(response.headers_mut(), decision);
            response
        }
        Err(e) => {
            warn!(target: "http", client = %client_ip, path = %request.uri().path(), "Rate limit exceeded");
            ApiError::from(e).into_response()
        }
    }
}

fn add_rate_limit_headers(headers: &mut HeaderMap, decision: RateDecision) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
}
