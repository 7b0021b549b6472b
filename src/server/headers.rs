//! Security headers middleware
//!
//! The service only returns JSON, so every response gets the locked-down API
//! profile:
//! - Content-Security-Policy: default-src 'none'; frame-ancestors 'none'
//! - X-Content-Type-Options: nosniff
//! - X-Frame-Options: DENY
//! - Referrer-Policy: no-referrer
//! - Strict-Transport-Security, when enabled (HTTPS deployments)

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request, Response},
    middleware::Next,
};
use std::sync::Arc;

/// Security headers configuration
#[derive(Debug, Clone)]
pub struct SecurityHeadersConfig {
    /// Content-Security-Policy header value
    pub csp: String,
    /// X-Frame-Options header value
    pub frame_options: String,
    /// X-Content-Type-Options header value
    pub content_type_options: String,
    /// Referrer-Policy header value
    pub referrer_policy: String,
    /// Strict-Transport-Security header value
    pub hsts: String,
    /// Whether to add HSTS header (should be true only for HTTPS)
    pub enable_hsts: bool,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        SecurityHeadersConfig {
            csp: "default-src 'none'; frame-ancestors 'none'".to_string(),
            frame_options: "DENY".to_string(),
            content_type_options: "nosniff".to_string(),
            referrer_policy: "no-referrer".to_string(),
            hsts: "max-age=31536000; includeSubDomains".to_string(),
            enable_hsts: false,
        }
    }
}

impl SecurityHeadersConfig {
    /// Enable HSTS (for HTTPS deployments)
    pub fn with_hsts(mut self, enable: bool) -> Self {
        self.enable_hsts = enable;
        self
    }
}

fn insert(headers: &mut axum::http::HeaderMap, name: header::HeaderName, value: &str) {
    if value.is_empty() {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

/// Security headers middleware function
///
/// Use with `axum::middleware::from_fn_with_state`.
pub async fn security_headers_middleware(
    State(config): State<Arc<SecurityHeadersConfig>>,
    request: Request<Body>,
    next: Next,
) -> Response<Body> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    insert(headers, header::CONTENT_SECURITY_POLICY, &config.csp);
    insert(headers, header::X_CONTENT_TYPE_OPTIONS, &config.content_type_options);
    insert(headers, header::X_FRAME_OPTIONS, &config.frame_options);
    insert(headers, header::REFERRER_POLICY, &config.referrer_policy);

    if config.enable_hsts {
        insert(headers, header::STRICT_TRANSPORT_SECURITY, &config.hsts);
    }

    response
}
