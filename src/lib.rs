//! metafetch library
//!
//! Batch URL metadata extraction behind a rate-limited, CSRF-protected HTTP
//! endpoint: each submitted URL yields either a `{url, title, description,
//! image}` record or a `{url, error}` failure, in input order.

pub mod admission;
pub mod batch;
pub mod cli;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod logging;
pub mod server;
