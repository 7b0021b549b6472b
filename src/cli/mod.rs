//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the HTTP service
//! - `fetch <URL>...` -- one-shot extraction, prints the batch result as JSON
//! - `config show|path` -- inspect configuration
//! - `status` -- query a running instance's health endpoint
//! - `version` -- print version info

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::admission::filter_candidates;
use crate::batch::BatchAggregator;
use crate::config::{self, ServiceConfig, DEFAULT_PORT};
use crate::extract::MetadataExtractor;
use crate::fetch::PageFetcher;

/// Batch URL metadata service.
#[derive(Parser, Debug)]
#[command(
    name = "metafetch",
    version = env!("CARGO_PKG_VERSION"),
    about = "metafetch: title, description and preview image for a batch of URLs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP service (default when no subcommand is given).
    Start,

    /// Extract metadata for the given URLs and print the results as JSON.
    Fetch {
        /// URLs to extract (invalid entries and duplicates are dropped).
        #[arg(required = true)]
        urls: Vec<String>,

        /// Print compact JSON instead of pretty-printed.
        #[arg(long)]
        compact: bool,
    },

    /// Inspect configuration.
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Query a running instance for health/status information.
    Status {
        /// Port of the running instance (default: from config or 3000).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print version and platform information.
    Version,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the fully resolved configuration as JSON.
    Show,

    /// Print the configuration file path, if one is in use.
    Path,
}

// ---------------------------------------------------------------------------
// Subcommand handlers
// ---------------------------------------------------------------------------

/// Run the `fetch` subcommand. No rate limiting or CSRF applies here.
pub async fn handle_fetch(
    cfg: &ServiceConfig,
    urls: &[String],
    compact: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let admitted = filter_candidates(urls.iter().map(String::as_str));
    if admitted.len() < urls.len() {
        eprintln!(
            "Skipping {} invalid or duplicate URL(s)",
            urls.len() - admitted.len()
        );
    }
    if admitted.len() > cfg.batch.max_urls {
        return Err(format!(
            "too many URLs: {} (max {})",
            admitted.len(),
            cfg.batch.max_urls
        )
        .into());
    }

    let extractor = MetadataExtractor::new(PageFetcher::new(cfg.fetch_config()));
    let aggregator = BatchAggregator::new(extractor, cfg.batch.max_concurrency);
    let results = aggregator.run(admitted).await;

    let rendered = if compact {
        serde_json::to_string(&results)?
    } else {
        serde_json::to_string_pretty(&results)?
    };
    println!("{}", rendered);
    Ok(())
}

/// Run the `config show` subcommand.
pub fn handle_config_show(cfg: &ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pretty = serde_json::to_string_pretty(cfg)?;
    println!("{}", pretty);
    Ok(())
}

/// Run the `config path` subcommand.
pub fn handle_config_path() {
    match config::get_config_path() {
        Some(path) => println!("{}", path.display()),
        None => println!("(none; using defaults and environment)"),
    }
}

/// Run the `status` subcommand -- connect to a running instance's health endpoint.
pub async fn handle_status(
    host: &str,
    port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_port(port);
    let url = format!("http://{}:{}/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to metafetch at {}:{}", host, port);
            eprintln!("  Error: {}", e);
            eprintln!();
            eprintln!("Is the server running? Start it with: metafetch start");
            std::process::exit(1);
        }
    };

    if !response.status().is_success() {
        eprintln!(
            "Health endpoint returned HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
        std::process::exit(1);
    }

    let body: Value = response.json().await?;

    println!("metafetch status");
    println!("================");
    if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
        println!("  Version:  {}", version);
    }
    if let Some(uptime) = body.get("uptimeSeconds").and_then(|v| v.as_i64()) {
        println!("  Uptime:   {}", format_duration(uptime));
    }
    println!("  Address:  {}:{}", host, port);
    if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
        println!("  Status:   {}", status);
    }

    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("metafetch {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Platform:   {} ({})",
        std::env::consts::OS,
        std::env::consts::ARCH
    );
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve the port to use for connecting to a running instance.
/// Tries (in order): explicit flag, loaded config, DEFAULT_PORT.
fn resolve_port(explicit: Option<u16>) -> u16 {
    if let Some(p) = explicit {
        return p;
    }
    config::load_config()
        .map(|cfg| cfg.port)
        .unwrap_or(DEFAULT_PORT)
}

/// Format seconds into a human-readable duration string.
fn format_duration(seconds: i64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let mins = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, mins, secs)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}
