use clap::Parser;
use tracing::{info, warn};

use metafetch::cli::{self, Cli, Command, ConfigCommand};
use metafetch::config::{self, ServiceConfig};
use metafetch::logging::{self, LogConfig};
use metafetch::server::startup::{run_server_with_config, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the server.
        None | Some(Command::Start) => {
            let cfg = config::load_config()?;
            logging::init_logging(LogConfig::from_settings(&cfg.logging))?;
            run_server(cfg).await
        }

        Some(Command::Fetch { urls, compact }) => {
            let cfg = config::load_config()?;
            // Results go to stdout; keep logs out of the way.
            logging::init_logging(LogConfig::from_settings(&cfg.logging).to_stderr())?;
            cli::handle_fetch(&cfg, &urls, compact).await
        }

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show(&config::load_config()?)?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Status { port, host }) => cli::handle_status(&host, port).await,

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server(cfg: ServiceConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        target: "config",
        environment = cfg.environment.as_str(),
        max_requests = cfg.rate_limit.max_requests,
        window_ms = cfg.rate_limit.window_ms,
        max_urls = cfg.batch.max_urls,
        "metafetch v{}",
        env!("CARGO_PKG_VERSION")
    );
    if cfg.fetch.allow_private_networks {
        warn!(target: "config", "private network fetches are allowed");
    }

    let server_config = ServerConfig::from_service_config(&cfg)?;
    let handle = run_server_with_config(server_config).await?;

    let reason = await_shutdown_trigger().await;
    info!(target: "http", "Shutdown signal received ({})", reason);
    handle.shutdown().await;
    info!(target: "http", "metafetch shut down");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "Failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            wait_for_ctrl_c().await
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            warn!("Failed to listen for Ctrl+C: {}; shutting down", e);
            "signal-error"
        }
    }
}
