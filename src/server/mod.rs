//! Server module
//!
//! HTTP endpoints and the security middleware in front of them.

pub mod csrf;
pub mod headers;
pub mod http;
pub mod ratelimit;
pub mod startup;

// Re-export key types
pub use http::{create_router_with_state, ApiError, AppState, HttpConfig, MiddlewareConfig};
pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
