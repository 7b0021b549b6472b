//! Configuration
//!
//! `ServiceConfig` is built in three layers:
//! 1. defaults for the selected environment (`METAFETCH_ENV`)
//! 2. an optional JSON5 file (`METAFETCH_CONFIG_PATH`, else `./metafetch.json5`)
//! 3. `METAFETCH_*` environment overrides
//!
//! String values in the file may reference environment variables as `${VAR}`
//! (`$${VAR}` for a literal).

use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::admission::DEFAULT_MAX_BATCH_URLS;
use crate::batch::DEFAULT_MAX_CONCURRENCY;
use crate::fetch::{
    FetchConfig, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_REDIRECTS,
};
use crate::server::csrf::CsrfConfig;
use crate::server::ratelimit::RateLimitConfig;

/// Default config file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "metafetch.json5";

/// Default listening port
pub const DEFAULT_PORT: u16 = 3000;

/// Default allowed cross-origin caller
pub const DEFAULT_CORS_ORIGIN: &str = "http://localhost:5173";

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

static ENV_VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").expect("env var regex"));

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnvVar { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Deserialize(String),

    #[error("Validation error at {path}: {message}")]
    Validation { path: String, message: String },
}

/// Deployment environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    #[default]
    Development,
    Test,
}

impl Environment {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Some(Self::Production),
            "development" | "dev" => Some(Self::Development),
            "test" => Some(Self::Test),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
            Self::Test => "test",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatSetting {
    Json,
    Plaintext,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSection {
    pub window_ms: u64,
    pub max_requests: u32,
    pub trust_proxy_headers: bool,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 5,
            trust_proxy_headers: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchSection {
    pub timeout_ms: u64,
    pub max_redirects: usize,
    pub max_body_bytes: u64,
    pub allow_private_networks: bool,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            allow_private_networks: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchSection {
    pub max_urls: usize,
    pub max_concurrency: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            max_urls: DEFAULT_MAX_BATCH_URLS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CsrfSection {
    pub token_ttl_secs: u64,
    pub secure_cookie: bool,
    pub check_origin: bool,
}

impl Default for CsrfSection {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3600,
            secure_cookie: false,
            check_origin: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSection {
    pub level: String,
    pub format: LogFormatSetting,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormatSetting::Plaintext,
        }
    }
}

/// Full service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceConfig {
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub rate_limit: RateLimitSection,
    pub cors_origins: Vec<String>,
    pub fetch: FetchSection,
    pub batch: BatchSection,
    pub csrf: CsrfSection,
    pub logging: LoggingSection,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::for_environment(Environment::Development)
    }
}

impl ServiceConfig {
    /// Defaults for one environment
    pub fn for_environment(environment: Environment) -> Self {
        let mut config = Self {
            environment,
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            rate_limit: RateLimitSection::default(),
            cors_origins: vec![DEFAULT_CORS_ORIGIN.to_string()],
            fetch: FetchSection::default(),
            batch: BatchSection::default(),
            csrf: CsrfSection::default(),
            logging: LoggingSection::default(),
        };

        match environment {
            Environment::Production => {
                config.csrf.secure_cookie = true;
                config.logging.format = LogFormatSetting::Json;
            }
            Environment::Development => {}
            Environment::Test => {
                config.rate_limit.window_ms = 1_000;
                config.rate_limit.max_requests = 100;
                config.fetch.allow_private_networks = true;
                config.logging.level = "warn".to_string();
            }
        }

        config
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(path: &str, message: &str) -> Result<(), ConfigError> {
            Err(ConfigError::Validation {
                path: path.to_string(),
                message: message.to_string(),
            })
        }

        if self.host.parse::<IpAddr>().is_err() {
            return invalid("host", "must be an IP address");
        }
        if self.rate_limit.window_ms == 0 {
            return invalid("rateLimit.windowMs", "must be greater than 0");
        }
        if self.rate_limit.max_requests == 0 {
            return invalid("rateLimit.maxRequests", "must be greater than 0");
        }
        if self.fetch.timeout_ms == 0 {
            return invalid("fetch.timeoutMs", "must be greater than 0");
        }
        if self.fetch.max_body_bytes == 0 {
            return invalid("fetch.maxBodyBytes", "must be greater than 0");
        }
        if self.batch.max_urls == 0 {
            return invalid("batch.maxUrls", "must be greater than 0");
        }
        if self.batch.max_concurrency == 0 {
            return invalid("batch.maxConcurrency", "must be greater than 0");
        }
        if self.csrf.token_ttl_secs == 0 {
            return invalid("csrf.tokenTtlSecs", "must be greater than 0");
        }
        for origin in &self.cors_origins {
            let parsed = url::Url::parse(origin).ok();
            let is_origin = parsed
                .as_ref()
                .is_some_and(|u| matches!(u.scheme(), "http" | "https") && u.host().is_some());
            if !is_origin {
                return Err(ConfigError::Validation {
                    path: "corsOrigins".to_string(),
                    message: format!("not an http(s) origin: {}", origin),
                });
            }
        }
        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return invalid("logging.level", "must be one of trace, debug, info, warn, error");
        }

        Ok(())
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::builder()
            .window(Duration::from_millis(self.rate_limit.window_ms))
            .max_requests(self.rate_limit.max_requests)
            .trust_proxy_headers(self.rate_limit.trust_proxy_headers)
            .build()
    }

    pub fn fetch_config(&self) -> FetchConfig {
        let config = FetchConfig::default()
            .with_timeout_ms(self.fetch.timeout_ms)
            .with_max_redirects(self.fetch.max_redirects)
            .with_max_body_bytes(self.fetch.max_body_bytes);
        if self.fetch.allow_private_networks {
            config.allow_private_networks()
        } else {
            config
        }
    }

    pub fn csrf_config(&self) -> CsrfConfig {
        CsrfConfig::builder()
            .token_ttl(Duration::from_secs(self.csrf.token_ttl_secs))
            .secure_cookie(self.csrf.secure_cookie)
            .check_origin(self.csrf.check_origin)
            .allowed_origins(self.cors_origins.clone())
            .build()
    }
}

/// Get the config file path.
/// Priority: METAFETCH_CONFIG_PATH > ./metafetch.json5 (if present)
pub fn get_config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("METAFETCH_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }
    let local = PathBuf::from(DEFAULT_CONFIG_FILE);
    local.exists().then_some(local)
}

/// Load configuration from the process environment.
pub fn load_config() -> Result<ServiceConfig, ConfigError> {
    load_config_with(get_config_path().as_deref(), |key| env::var(key).ok())
}

/// Load configuration from an optional file and an environment lookup.
pub fn load_config_with<F>(path: Option<&Path>, lookup: F) -> Result<ServiceConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let environment = match lookup("METAFETCH_ENV") {
        Some(raw) => Environment::parse(&raw).ok_or(ConfigError::InvalidEnvVar {
            var: "METAFETCH_ENV".to_string(),
            value: raw,
        })?,
        None => Environment::default(),
    };

    let mut merged = serde_json::to_value(ServiceConfig::for_environment(environment))
        .map_err(|e| ConfigError::Deserialize(e.to_string()))?;

    if let Some(path) = path {
        let overlay = load_file(path, &lookup)?;
        deep_merge(&mut merged, overlay);
    }

    let mut config: ServiceConfig =
        serde_json::from_value(merged).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
    config.environment = environment;

    apply_env_overrides(&mut config, &lookup)?;
    config.validate()?;

    tracing::debug!(
        target: "config",
        environment = environment.as_str(),
        file = ?path,
        "configuration loaded"
    );

    Ok(config)
}

fn load_file<F>(path: &Path, lookup: &F) -> Result<Value, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    if !value.is_object() {
        return Err(ConfigError::ParseError {
            path: path.display().to_string(),
            message: "top-level value must be an object".to_string(),
        });
    }
    substitute_env_vars(&mut value, lookup)?;
    Ok(value)
}

/// Parse JSON5 content
fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Deep merge two JSON values.
/// Rules: objects merge recursively, arrays and primitives override.
fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_obj), Value::Object(overlay_obj)) => {
            for (key, overlay_value) in overlay_obj {
                match base_obj.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_obj.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay;
        }
    }
}

/// Substitute `${VAR}` references in string values.
fn substitute_env_vars<F>(value: &mut Value, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s, lookup)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v, lookup)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item, lookup)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn substitute_env_in_string<F>(s: &str, lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();

        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = lookup(var_name).ok_or_else(|| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);
    Ok(result)
}

fn parse_env<T, F>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvVar {
                var: var.to_string(),
                value: raw,
            }),
    }
}

fn parse_env_bool<F>(lookup: &F, var: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidEnvVar {
                var: var.to_string(),
                value: raw,
            }),
        },
    }
}

/// Apply `METAFETCH_*` overrides.
fn apply_env_overrides<F>(config: &mut ServiceConfig, lookup: &F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("METAFETCH_HOST") {
        config.host = host.trim().to_string();
    }
    if let Some(port) = parse_env(lookup, "METAFETCH_PORT")? {
        config.port = port;
    } else if let Some(port) = parse_env(lookup, "PORT")? {
        config.port = port;
    }
    if let Some(window_ms) = parse_env(lookup, "METAFETCH_RATE_WINDOW_MS")? {
        config.rate_limit.window_ms = window_ms;
    }
    if let Some(max) = parse_env(lookup, "METAFETCH_RATE_MAX")? {
        config.rate_limit.max_requests = max;
    }
    if let Some(trust) = parse_env_bool(lookup, "METAFETCH_TRUST_PROXY")? {
        config.rate_limit.trust_proxy_headers = trust;
    }
    if let Some(origins) = lookup("METAFETCH_CORS_ORIGINS") {
        config.cors_origins = origins
            .split(',')
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
    }
    if let Some(timeout_ms) = parse_env(lookup, "METAFETCH_FETCH_TIMEOUT_MS")? {
        config.fetch.timeout_ms = timeout_ms;
    }
    if let Some(max_redirects) = parse_env(lookup, "METAFETCH_MAX_REDIRECTS")? {
        config.fetch.max_redirects = max_redirects;
    }
    if let Some(allow) = parse_env_bool(lookup, "METAFETCH_ALLOW_PRIVATE_NETWORKS")? {
        config.fetch.allow_private_networks = allow;
    }
    if let Some(max_urls) = parse_env(lookup, "METAFETCH_MAX_BATCH")? {
        config.batch.max_urls = max_urls;
    }
    if let Some(max_concurrency) = parse_env(lookup, "METAFETCH_MAX_CONCURRENCY")? {
        config.batch.max_concurrency = max_concurrency;
    }
    if let Some(secure) = parse_env_bool(lookup, "METAFETCH_SECURE_COOKIE")? {
        config.csrf.secure_cookie = secure;
    }
    Ok(())
}
