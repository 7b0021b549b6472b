//! CSRF protection middleware
//!
//! Session-bound anti-forgery tokens for state-changing routes:
//! - `GET /get-csrf-token` mints a session (HttpOnly cookie) and a token
//! - Protected POSTs must echo the token in `X-CSRF-Token`
//! - A token is consumed by the check that accepts it; the replacement
//!   travels to the handler in [`ValidatedSession`]
//!
//! Sessions live in a `DashMap`, so concurrent requests for one session
//! serialize on that key only.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::http::ApiError;

/// CSRF token length in bytes (before base64 encoding)
const TOKEN_BYTES: usize = 32;

/// Default CSRF token validity duration (1 hour)
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

/// Session cookie name (insecure / non-TLS)
const DEFAULT_SESSION_COOKIE: &str = "session";

/// Session cookie name (secure / TLS)
const DEFAULT_SESSION_COOKIE_HOST: &str = "__Host-session";

/// Default header name for CSRF token
pub const DEFAULT_HEADER_NAME: &str = "x-csrf-token";

/// Sweep expired sessions once the table grows past this size
const SWEEP_THRESHOLD: usize = 1000;

/// CSRF errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CsrfError {
    #[error("CSRF token missing")]
    TokenMissing,

    #[error("CSRF token invalid")]
    TokenInvalid,

    #[error("CSRF token expired")]
    TokenExpired,

    #[error("CSRF session missing")]
    SessionMissing,

    #[error("CSRF token generation failed")]
    GenerationFailed,

    #[error("Origin mismatch: expected {expected}, got {actual}")]
    OriginMismatch { expected: String, actual: String },

    #[error("Origin missing")]
    OriginMissing,

    #[error("Origin host missing")]
    OriginHostMissing,
}

/// CSRF protection configuration
#[derive(Debug, Clone)]
pub struct CsrfConfig {
    /// Session and token time-to-live
    pub token_ttl: Duration,
    /// Whether to check Origin header
    pub check_origin: bool,
    /// Allowed origins (empty = allow same-origin only)
    pub allowed_origins: Vec<String>,
    /// Paths that require CSRF protection (exact match)
    pub protected_paths: Vec<String>,
    /// Whether CSRF is enabled
    pub enabled: bool,
    /// Use secure cookies (HTTPS only)
    pub secure_cookie: bool,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        CsrfConfig {
            token_ttl: DEFAULT_TOKEN_TTL,
            check_origin: false,
            allowed_origins: Vec::new(),
            protected_paths: vec!["/fetch-metadata".to_string()],
            enabled: true,
            secure_cookie: true,
        }
    }
}

impl CsrfConfig {
    /// Create a builder for custom configuration
    pub fn builder() -> CsrfConfigBuilder {
        CsrfConfigBuilder::default()
    }

    /// Check if a path requires CSRF protection
    pub fn requires_protection(&self, path: &str) -> bool {
        self.protected_paths.iter().any(|p| p == path)
    }
}

/// Builder for CsrfConfig
#[derive(Default)]
pub struct CsrfConfigBuilder {
    config: CsrfConfig,
}

impl CsrfConfigBuilder {
    /// Set the token TTL
    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.config.token_ttl = ttl;
        self
    }

    /// Set whether to check Origin header
    pub fn check_origin(mut self, check: bool) -> Self {
        self.config.check_origin = check;
        self
    }

    /// Add allowed origins
    pub fn allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.config.allowed_origins = origins;
        self
    }

    /// Set protected paths
    pub fn protected_paths(mut self, paths: Vec<String>) -> Self {
        self.config.protected_paths = paths;
        self
    }

    /// Enable or disable CSRF protection
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Set secure cookie flag
    pub fn secure_cookie(mut self, secure: bool) -> Self {
        self.config.secure_cookie = secure;
        self
    }

    /// Build the configuration
    pub fn build(self) -> CsrfConfig {
        self.config
    }
}

/// Server-side state for one session
#[derive(Debug, Clone)]
pub struct CsrfSession {
    /// Current token (base64url encoded)
    pub token: String,
    /// When the current token was issued
    pub issued_at: Instant,
}

impl CsrfSession {
    fn new(token: String) -> Self {
        Self {
            token,
            issued_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.issued_at.elapsed() > ttl
    }
}

/// Result of a token request
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Session the token is bound to
    pub session_id: String,
    /// Token to hand to the caller
    pub token: String,
    /// Whether a new session was minted (cookie must be set)
    pub new_session: bool,
}

/// Token that replaced the one a request was admitted with, stored in
/// request extensions for the handler to return
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub next_token: String,
}

/// CSRF session store
#[derive(Clone)]
pub struct CsrfTokenStore {
    sessions: Arc<DashMap<String, CsrfSession>>,
    config: Arc<CsrfConfig>,
}

impl CsrfTokenStore {
    /// Create a new token store
    pub fn new(config: CsrfConfig) -> Self {
        CsrfTokenStore {
            sessions: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    /// Return the current token for `session_id`, or mint a new session.
    ///
    /// Unknown or expired session ids are never adopted; a fresh id is
    /// generated instead.
    pub fn issue(&self, session_id: Option<&str>) -> Result<IssuedToken, CsrfError> {
        if let Some(id) = session_id {
            if let Some(session) = self.sessions.get(id) {
                if !session.is_expired(self.config.token_ttl) {
                    return Ok(IssuedToken {
                        session_id: id.to_string(),
                        token: session.token.clone(),
                        new_session: false,
                    });
                }
            }
        }

        self.maybe_sweep();

        let session_id = generate_token_value()?;
        let token = generate_token_value()?;
        self.sessions
            .insert(session_id.clone(), CsrfSession::new(token.clone()));

        Ok(IssuedToken {
            session_id,
            token,
            new_session: true,
        })
    }

    /// Check `provided_token` against the session and swap in a fresh token.
    ///
    /// Check and swap happen under the session's entry lock, so of two
    /// requests carrying the same token exactly one is accepted. Returns the
    /// replacement token.
    pub fn validate_and_rotate(
        &self,
        session_id: &str,
        provided_token: &str,
    ) -> Result<String, CsrfError> {
        let next_token = generate_token_value()?;

        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or(CsrfError::SessionMissing)?;

        if session.is_expired(self.config.token_ttl) {
            return Err(CsrfError::TokenExpired);
        }

        if !timing_safe_eq(&session.token, provided_token) {
            return Err(CsrfError::TokenInvalid);
        }

        *session = CsrfSession::new(next_token.clone());
        Ok(next_token)
    }

    /// Number of tracked sessions
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get the configuration
    pub fn config(&self) -> &CsrfConfig {
        &self.config
    }

    /// Drop expired sessions, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        let ttl = self.config.token_ttl;
        self.sessions.retain(|_, s| !s.is_expired(ttl));
        let removed = before.saturating_sub(self.sessions.len());
        debug!(target: "http", removed, remaining = self.sessions.len(), "CSRF session sweep");
        removed
    }

    fn maybe_sweep(&self) {
        if self.sessions.len() > SWEEP_THRESHOLD {
            self.purge_expired();
        }
    }
}

/// Constant-time string comparison
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

/// Generate a random base64url value using getrandom
fn generate_token_value() -> Result<String, CsrfError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes).map_err(|_| CsrfError::GenerationFailed)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Extract a cookie value by name from the request headers.
fn extract_cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{}=", name);

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|s| s.split(';'))
        .map(|part| part.trim())
        .find_map(|part| part.strip_prefix(&prefix).map(|value| value.to_string()))
        .filter(|value| !value.is_empty())
}

pub fn session_cookie_name(config: &CsrfConfig) -> &'static str {
    if config.secure_cookie {
        DEFAULT_SESSION_COOKIE_HOST
    } else {
        DEFAULT_SESSION_COOKIE
    }
}

/// Extract session ID from cookies
pub fn extract_session_id(headers: &HeaderMap, config: &CsrfConfig) -> Option<String> {
    extract_cookie_value(headers, session_cookie_name(config))
}

/// Extract CSRF token from request header
fn extract_csrf_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DEFAULT_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Generate a Set-Cookie header value for the session cookie
pub fn session_cookie_header(session_id: &str, config: &CsrfConfig) -> String {
    let secure = if config.secure_cookie { "; Secure" } else { "" };
    let max_age = config.token_ttl.as_secs();

    format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict{}; Max-Age={}",
        session_cookie_name(config),
        session_id,
        secure,
        max_age
    )
}

/// Check Origin header
fn check_origin(headers: &HeaderMap, config: &CsrfConfig) -> Result<(), CsrfError> {
    if !config.check_origin {
        return Ok(());
    }

    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(':').next().unwrap_or(s));

    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .or_else(|| headers.get(header::REFERER).and_then(|v| v.to_str().ok()));

    let Some(origin) = origin else {
        debug!(target: "http", "No Origin header in CSRF-protected request");
        return Err(CsrfError::OriginMissing);
    };

    let origin = origin.trim_end_matches('/');
    if config
        .allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/') == origin)
    {
        return Ok(());
    }

    let Some(host) = host else {
        return Err(CsrfError::OriginHostMissing);
    };

    let origin_host = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
        .unwrap_or(origin)
        .split(['/', ':'])
        .next()
        .unwrap_or("");

    if origin_host == host {
        return Ok(());
    }

    Err(CsrfError::OriginMismatch {
        expected: host.to_string(),
        actual: origin_host.to_string(),
    })
}

/// Determine if CSRF validation is needed for this request.
fn should_validate_csrf(method: &Method, path: &str, config: &CsrfConfig) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::DELETE | Method::PATCH
    ) && config.requires_protection(path)
}

/// Run every check for a protected request and consume its token.
/// Returns the replacement token.
pub fn validate_request(headers: &HeaderMap, store: &CsrfTokenStore) -> Result<String, CsrfError> {
    let config = store.config();

    check_origin(headers, config)?;

    let session_id = extract_session_id(headers, config).ok_or(CsrfError::SessionMissing)?;
    let provided_token = extract_csrf_token(headers).ok_or(CsrfError::TokenMissing)?;

    store.validate_and_rotate(&session_id, &provided_token)
}

/// CSRF protection middleware
///
/// Validates tokens for state-changing requests to protected paths and
/// records the replacement token in request extensions.
pub async fn csrf_middleware(
    State(store): State<CsrfTokenStore>,
    mut request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let config = store.config();

    if !config.enabled || !should_validate_csrf(request.method(), request.uri().path(), config) {
        return next.run(request).await;
    }

    match validate_request(request.headers(), &store) {
        Ok(next_token) => {
            debug!(target: "http", path = %request.uri().path(), "CSRF validation passed");
            request
                .extensions_mut()
                .insert(ValidatedSession { next_token });
            next.run(request).await
        }
        Err(e) => {
            warn!(target: "http", path = %request.uri().path(), error = %e, "CSRF validation failed");
            ApiError::from(e).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn store() -> CsrfTokenStore {
        CsrfTokenStore::new(CsrfConfig::builder().secure_cookie(false).build())
    }

    fn protected_headers(session_id: &str, token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("theme=dark; session={}", session_id)).unwrap(),
        );
        headers.insert("x-csrf-token", HeaderValue::from_str(token).unwrap());
        headers
    }

    #[test]
    fn test_issue_mints_session_without_cookie() {
        let store = store();
        let issued = store.issue(None).unwrap();

        assert!(issued.new_session);
        assert_eq!(issued.token.len(), 43);
        assert_ne!(issued.token, issued.session_id);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_issue_reuses_live_session() {
        let store = store();
        let first = store.issue(None).unwrap();
        let second = store.issue(Some(&first.session_id)).unwrap();

        assert!(!second.new_session);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.token, first.token);
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn test_issue_never_adopts_unknown_session() {
        let store = store();
        let issued = store.issue(Some("attacker-chosen")).unwrap();

        assert!(issued.new_session);
        assert_ne!(issued.session_id, "attacker-chosen");
        assert_eq!(
            store.validate_and_rotate("attacker-chosen", &issued.token),
            Err(CsrfError::SessionMissing)
        );
    }

    #[test]
    fn test_validate_and_rotate() {
        let store = store();
        let issued = store.issue(None).unwrap();

        assert_eq!(
            store.validate_and_rotate(&issued.session_id, "wrong"),
            Err(CsrfError::TokenInvalid)
        );
        assert_eq!(
            store.validate_and_rotate("no-such-session", &issued.token),
            Err(CsrfError::SessionMissing)
        );

        let next = store
            .validate_and_rotate(&issued.session_id, &issued.token)
            .unwrap();
        assert_ne!(next, issued.token);

        // The accepted token is spent; its replacement is now current.
        assert_eq!(
            store.validate_and_rotate(&issued.session_id, &issued.token),
            Err(CsrfError::TokenInvalid)
        );
        assert_eq!(store.issue(Some(&issued.session_id)).unwrap().token, next);
        assert!(store.validate_and_rotate(&issued.session_id, &next).is_ok());
    }

    #[test]
    fn test_failed_check_keeps_current_token() {
        let store = store();
        let issued = store.issue(None).unwrap();

        assert!(store.validate_and_rotate(&issued.session_id, "forged").is_err());
        assert!(store
            .validate_and_rotate(&issued.session_id, &issued.token)
            .is_ok());
    }

    #[test]
    fn test_token_bound_to_session() {
        let store = store();
        let a = store.issue(None).unwrap();
        let b = store.issue(None).unwrap();

        assert_eq!(
            store.validate_and_rotate(&a.session_id, &b.token),
            Err(CsrfError::TokenInvalid)
        );
    }

    #[test]
    fn test_same_token_accepted_once_across_threads() {
        let store = store();
        let issued = store.issue(None).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let session_id = issued.session_id.clone();
                let token = issued.token.clone();
                std::thread::spawn(move || store.validate_and_rotate(&session_id, &token))
            })
            .collect();

        let accepted: Vec<String> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap().ok())
            .collect();
        assert_eq!(accepted.len(), 1);

        // The single winner holds the live token.
        assert!(store
            .validate_and_rotate(&issued.session_id, &accepted[0])
            .is_ok());
    }

    #[test]
    fn test_expired_token() {
        let store = CsrfTokenStore::new(CsrfConfig::builder().token_ttl(Duration::ZERO).build());
        let issued = store.issue(None).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(
            store.validate_and_rotate(&issued.session_id, &issued.token),
            Err(CsrfError::TokenExpired)
        );
        assert!(store.issue(Some(&issued.session_id)).unwrap().new_session);
    }

    #[test]
    fn test_purge_expired() {
        let store = CsrfTokenStore::new(
            CsrfConfig::builder()
                .token_ttl(Duration::from_millis(1))
                .build(),
        );
        store.issue(None).unwrap();
        store.issue(None).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(store.purge_expired(), 2);
        assert_eq!(store.session_count(), 0);
    }

    #[test]
    fn test_validate_request() {
        let store = store();
        let issued = store.issue(None).unwrap();

        let headers = protected_headers(&issued.session_id, &issued.token);
        let next = validate_request(&headers, &store).unwrap();
        assert_ne!(next, issued.token);
        assert_eq!(validate_request(&headers, &store), Err(CsrfError::TokenInvalid));

        let mut no_token = headers.clone();
        no_token.remove("x-csrf-token");
        assert_eq!(validate_request(&no_token, &store), Err(CsrfError::TokenMissing));

        let mut no_cookie = headers.clone();
        no_cookie.remove(header::COOKIE);
        assert_eq!(validate_request(&no_cookie, &store), Err(CsrfError::SessionMissing));
    }

    #[test]
    fn test_origin_check() {
        let config = CsrfConfig::builder()
            .check_origin(true)
            .allowed_origins(vec!["http://localhost:5173".to_string()])
            .build();

        let mut headers = HeaderMap::new();
        assert_eq!(check_origin(&headers, &config), Err(CsrfError::OriginMissing));

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://localhost:5173"));
        assert!(check_origin(&headers, &config).is_ok());

        headers.insert(header::ORIGIN, HeaderValue::from_static("http://localhost:5173.evil.com"));
        headers.insert(header::HOST, HeaderValue::from_static("api.example.com"));
        assert!(matches!(
            check_origin(&headers, &config),
            Err(CsrfError::OriginMismatch { .. })
        ));

        headers.insert(header::ORIGIN, HeaderValue::from_static("https://api.example.com"));
        assert!(check_origin(&headers, &config).is_ok());
    }

    #[test]
    fn test_session_cookie_header() {
        let secure = CsrfConfig::default();
        let header = session_cookie_header("abc", &secure);
        assert!(header.starts_with("__Host-session=abc; Path=/; HttpOnly; SameSite=Strict; Secure"));

        let insecure = CsrfConfig::builder().secure_cookie(false).build();
        let header = session_cookie_header("abc", &insecure);
        assert!(header.starts_with("session=abc;"));
        assert!(!header.contains("Secure"));
    }

    #[test]
    fn test_extract_cookie_value() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("a=1; session=xyz; b=2"));
        assert_eq!(extract_cookie_value(&headers, "session"), Some("xyz".to_string()));
        assert_eq!(extract_cookie_value(&headers, "missing"), None);

        headers.insert(header::COOKIE, HeaderValue::from_static("session="));
        assert_eq!(extract_cookie_value(&headers, "session"), None);
    }

    #[test]
    fn test_should_validate_csrf() {
        let config = CsrfConfig::default();
        assert!(should_validate_csrf(&Method::POST, "/fetch-metadata", &config));
        assert!(!should_validate_csrf(&Method::GET, "/fetch-metadata", &config));
        assert!(!should_validate_csrf(&Method::POST, "/get-csrf-token", &config));
    }

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq("abc", "abc"));
        assert!(!timing_safe_eq("abc", "abd"));
        assert!(!timing_safe_eq("abc", "abcd"));
    }
}
