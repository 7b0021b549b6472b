//! HTTP server implementation
//!
//! Implements:
//! - Token issuance (GET /get-csrf-token)
//! - Batch metadata extraction (POST /fetch-metadata)
//! - Liveness probe (GET /health)
//! - Security middleware (CORS, headers, rate limiting, CSRF, panic catching)
//!
//! Per request the order is: rate limit, CSRF check (protected routes; the
//! accepted token is spent on the spot), URL admission, batch extraction,
//! response assembly with the replacement token.
//! Anything rejected before extraction never reaches the network.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{rejection::BytesRejection, DefaultBodyLimit, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error, warn};

use crate::admission::{admit_urls, AdmissionError};
use crate::batch::BatchAggregator;
use crate::config::{Environment, ServiceConfig};
use crate::extract::MetadataExtractor;
use crate::fetch::PageFetcher;
use crate::server::csrf::{
    csrf_middleware, extract_session_id, session_cookie_header, CsrfConfig, CsrfError,
    CsrfTokenStore, ValidatedSession,
};
use crate::server::headers::{security_headers_middleware, SecurityHeadersConfig};
use crate::server::ratelimit::{rate_limit_middleware, RateLimitConfig, RateLimitError, RateLimiter};

/// Default max request body size (1MB)
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 1024 * 1024;

const GENERIC_INTERNAL_ERROR: &str = "Internal server error";

/// Endpoint-level errors. Every variant renders as `{"error": string}`.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    ForgeryCheckFailed(String),

    #[error("Too many requests, please try again later.")]
    RateLimited { retry_after_secs: u64 },

    #[error("{message}")]
    Internal { message: String, expose: bool },
}

impl ApiError {
    /// Internal error whose detail is only shown outside production
    pub fn internal(message: impl std::fmt::Display, environment: Environment) -> Self {
        ApiError::Internal {
            message: message.to_string(),
            expose: !environment.is_production(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::ForgeryCheckFailed(_) => StatusCode::FORBIDDEN,
            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        ApiError::InvalidInput(e.to_string())
    }
}

impl From<RateLimitError> for ApiError {
    fn from(e: RateLimitError) -> Self {
        ApiError::RateLimited {
            retry_after_secs: e.retry_after_secs(),
        }
    }
}

impl From<CsrfError> for ApiError {
    fn from(e: CsrfError) -> Self {
        let message = match e {
            CsrfError::TokenMissing | CsrfError::SessionMissing => "CSRF token missing",
            CsrfError::TokenInvalid => "Invalid CSRF token",
            CsrfError::TokenExpired => "CSRF token expired",
            CsrfError::OriginMismatch { .. } => "Origin mismatch",
            CsrfError::OriginMissing => "Origin missing",
            CsrfError::OriginHostMissing => "Origin host missing",
            CsrfError::GenerationFailed => {
                return ApiError::Internal {
                    message: e.to_string(),
                    expose: false,
                }
            }
        };
        ApiError::ForgeryCheckFailed(message.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal { message, expose } => {
                error!(target: "http", error = %message, "internal error");
                if *expose {
                    message.clone()
                } else {
                    GENERIC_INTERNAL_ERROR.to_string()
                }
            }
            other => other.to_string(),
        };

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if let ApiError::RateLimited { retry_after_secs } = self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        response
    }
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Deployment environment (controls error detail)
    pub environment: Environment,
    /// Ceiling on admitted URLs per request
    pub max_batch_urls: usize,
    /// Origins allowed to call cross-origin
    pub cors_origins: Vec<String>,
    /// Max request body size in bytes
    pub max_request_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            environment: Environment::Development,
            max_batch_urls: crate::admission::DEFAULT_MAX_BATCH_URLS,
            cors_origins: vec![crate::config::DEFAULT_CORS_ORIGIN.to_string()],
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

impl HttpConfig {
    pub fn from_service_config(cfg: &ServiceConfig) -> Self {
        HttpConfig {
            environment: cfg.environment,
            max_batch_urls: cfg.batch.max_urls,
            cors_origins: cfg.cors_origins.clone(),
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
        }
    }
}

/// Middleware configuration for the HTTP server
#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    /// Security headers configuration
    pub security_headers: SecurityHeadersConfig,
    /// CSRF protection configuration
    pub csrf: CsrfConfig,
    /// Rate limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Whether to enable security headers middleware
    pub enable_security_headers: bool,
    /// Whether to enable CSRF middleware
    pub enable_csrf: bool,
    /// Whether to enable rate limiting middleware
    pub enable_rate_limit: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self::full()
    }
}

impl MiddlewareConfig {
    /// Create a configuration with all middleware disabled (for testing)
    pub fn none() -> Self {
        MiddlewareConfig {
            security_headers: SecurityHeadersConfig::default(),
            csrf: CsrfConfig::default(),
            rate_limit: RateLimitConfig::default(),
            enable_security_headers: false,
            enable_csrf: false,
            enable_rate_limit: false,
        }
    }

    /// Create a configuration with all security middleware enabled
    pub fn full() -> Self {
        MiddlewareConfig {
            security_headers: SecurityHeadersConfig::default(),
            csrf: CsrfConfig::default(),
            rate_limit: RateLimitConfig::default(),
            enable_security_headers: true,
            enable_csrf: true,
            enable_rate_limit: true,
        }
    }

    pub fn from_service_config(cfg: &ServiceConfig) -> Self {
        MiddlewareConfig {
            csrf: cfg.csrf_config(),
            rate_limit: cfg.rate_limit_config(),
            ..Self::full()
        }
    }
}

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HttpConfig>,
    /// Fan-out/fan-in extraction
    pub aggregator: BatchAggregator,
    /// Session/token table
    pub csrf_store: CsrfTokenStore,
    /// Per-client request windows
    pub rate_limiter: RateLimiter,
    /// Server start time (Unix timestamp)
    pub start_time: i64,
}

impl AppState {
    pub fn new(
        config: HttpConfig,
        middleware_config: &MiddlewareConfig,
        aggregator: BatchAggregator,
    ) -> Self {
        AppState {
            config: Arc::new(config),
            aggregator,
            csrf_store: CsrfTokenStore::new(middleware_config.csrf.clone()),
            rate_limiter: RateLimiter::new(middleware_config.rate_limit.clone()),
            start_time: chrono::Utc::now().timestamp(),
        }
    }

    /// Build the full state from a loaded service configuration
    pub fn from_service_config(cfg: &ServiceConfig) -> (Self, MiddlewareConfig) {
        let middleware_config = MiddlewareConfig::from_service_config(cfg);
        let extractor = MetadataExtractor::new(PageFetcher::new(cfg.fetch_config()));
        let aggregator = BatchAggregator::new(extractor, cfg.batch.max_concurrency);
        let state = Self::new(
            HttpConfig::from_service_config(cfg),
            &middleware_config,
            aggregator,
        );
        (state, middleware_config)
    }

    fn internal_error(&self, message: impl std::fmt::Display) -> ApiError {
        ApiError::internal(message, self.config.environment)
    }
}

/// Create the HTTP router with all endpoints and middleware
pub fn create_router_with_state(state: AppState, middleware_config: &MiddlewareConfig) -> Router {
    let environment = state.config.environment;
    let cors = cors_layer(&state.config.cors_origins);
    let max_request_bytes = state.config.max_request_bytes;

    let router: Router<AppState> = Router::new()
        .route("/get-csrf-token", get(get_csrf_token_handler))
        .route(
            "/fetch-metadata",
            post(fetch_metadata_handler).layer(DefaultBodyLimit::max(max_request_bytes)),
        )
        .route("/health", get(health_handler))
        .fallback(not_found_handler);

    // Layers wrap outward: the last one added runs first.
    // Execution order: cors -> security headers -> rate limit -> csrf -> panic catcher -> handler
    let mut stateless_router: Router = router
        .with_state(state.clone())
        .layer(CatchPanicLayer::custom(move |panic: Box<dyn Any + Send + 'static>| {
            panic_response(panic, environment)
        }));

    if middleware_config.enable_csrf {
        stateless_router = stateless_router.layer(middleware::from_fn_with_state(
            state.csrf_store.clone(),
            csrf_middleware,
        ));
    }

    if middleware_config.enable_rate_limit {
        stateless_router = stateless_router.layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));
    }

    if middleware_config.enable_security_headers {
        let headers_config = Arc::new(middleware_config.security_headers.clone());
        stateless_router = stateless_router.layer(middleware::from_fn_with_state(
            headers_config,
            security_headers_middleware,
        ));
    }

    stateless_router.layer(cors)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o.trim_end_matches('/')).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(crate::server::csrf::DEFAULT_HEADER_NAME),
        ])
}

fn panic_response(panic: Box<dyn Any + Send + 'static>, environment: Environment) -> Response<Body> {
    let detail = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    ApiError::internal(detail, environment).into_response()
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /get-csrf-token - Returns the session's token, minting a session if needed.
async fn get_csrf_token_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let config = state.csrf_store.config();
    let existing = extract_session_id(&headers, config);
    let issued = state.csrf_store.issue(existing.as_deref())?;

    let mut response = Json(json!({ "csrfToken": issued.token })).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    if issued.new_session {
        debug!(target: "http", "minted new CSRF session");
        let cookie = session_cookie_header(&issued.session_id, config);
        let value = HeaderValue::from_str(&cookie).map_err(|e| state.internal_error(e))?;
        response_headers.insert(header::SET_COOKIE, value);
    }

    Ok(response)
}

/// POST /fetch-metadata - Extracts metadata for every admitted URL.
async fn fetch_metadata_handler(
    State(state): State<AppState>,
    session: Option<Extension<ValidatedSession>>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, ApiError> {
    let body = body.map_err(|e| {
        warn!(target: "http", status = %e.status(), "unreadable request body");
        ApiError::InvalidInput(format!("Invalid input: {}", e.body_text()))
    })?;
    let payload: Value = serde_json::from_slice(&body).map_err(|_| {
        ApiError::InvalidInput("Invalid input: request body must be a JSON object".to_string())
    })?;

    let urls = admit_urls(payload.get("urls"), state.config.max_batch_urls).map_err(|e| {
        warn!(target: "http", error = %e, "rejected batch");
        ApiError::from(e)
    })?;

    debug!(target: "http", count = urls.len(), "admitted batch");
    let results = state.aggregator.run(urls).await;

    let mut set_cookie = None;
    let csrf_token = match session {
        Some(Extension(ValidatedSession { next_token })) => next_token,
        None => {
            // CSRF middleware disabled; hand out a token for the caller's session anyway.
            let config = state.csrf_store.config();
            let issued = state
                .csrf_store
                .issue(extract_session_id(&headers, config).as_deref())?;
            if issued.new_session {
                set_cookie = Some(session_cookie_header(&issued.session_id, config));
            }
            issued.token
        }
    };

    let mut response = Json(json!({
        "csrfToken": csrf_token,
        "metadataResults": results,
    }))
    .into_response();

    if let Some(cookie) = set_cookie {
        let value = HeaderValue::from_str(&cookie).map_err(|e| state.internal_error(e))?;
        response.headers_mut().insert(header::SET_COOKIE, value);
    }

    Ok(response)
}

/// GET /health - Lightweight liveness probe.
async fn health_handler(State(state): State<AppState>) -> Response {
    let uptime = chrono::Utc::now().timestamp() - state.start_time;
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "uptimeSeconds": uptime,
        })),
    )
        .into_response()
}

async fn not_found_handler() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

/// Client address used when a router is driven without a listener
pub fn default_test_addr() -> SocketAddr {
    SocketAddr::from(([203, 0, 113, 10], 40000))
}
