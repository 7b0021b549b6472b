//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real metafetch server on an ephemeral port, exercise its HTTP
//! endpoints, and shut it down cleanly.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServiceConfig;
use crate::server::http::{create_router_with_state, AppState, MiddlewareConfig};
use crate::server::csrf::CsrfTokenStore;
use crate::server::ratelimit::RateLimiter;

/// Interval between sweeps of expired sessions and elapsed rate windows
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Everything needed to start a server.
pub struct ServerConfig {
    pub state: AppState,
    pub middleware_config: MiddlewareConfig,
    pub bind_address: SocketAddr,
    /// When `false` (e.g. in tests), the periodic sweep task is not spawned.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    /// Assemble everything from a loaded service configuration.
    pub fn from_service_config(cfg: &ServiceConfig) -> Result<Self, std::net::AddrParseError> {
        let ip: IpAddr = cfg.host.parse()?;
        let (state, middleware_config) = AppState::from_service_config(cfg);
        let bind_address = SocketAddr::new(ip, cfg.port);
        Ok(ServerConfig {
            state,
            middleware_config,
            bind_address,
            spawn_background_tasks: true,
        })
    }

    /// Config suitable for integration tests.
    ///
    /// Uses the test environment profile, binds to `127.0.0.1:0`
    /// (OS-assigned port) and skips background tasks. Middleware stays on.
    pub fn for_testing() -> Self {
        let cfg = ServiceConfig::for_environment(crate::config::Environment::Test);
        let (state, middleware_config) = AppState::from_service_config(&cfg);
        ServerConfig {
            state,
            middleware_config,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            spawn_background_tasks: false,
        }
    }
}

/// Handle to a running server.  Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    state: AppState,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The full local address (ip + port).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Shared rate limiter, for resetting windows between test cases.
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.state.rate_limiter
    }

    /// Shared CSRF session table.
    pub fn csrf_store(&self) -> &CsrfTokenStore {
        &self.state.csrf_store
    }

    /// Trigger graceful shutdown and await the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);

        // Wait for the server task to finish (with a timeout to avoid hanging)
        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(target: "http", "Server task returned error: {}", e),
            Ok(Err(e)) => error!(target: "http", "Server task panicked: {}", e),
            Err(_) => warn!(target: "http", "Server task did not finish within 5s timeout"),
        }
    }
}

/// Spawn the periodic sweep of expired CSRF sessions and elapsed rate windows.
pub fn spawn_background_tasks(
    state: &AppState,
    interval: Duration,
    shutdown_rx: &watch::Receiver<bool>,
) -> JoinHandle<()> {
    let csrf_store = state.csrf_store.clone();
    let limiter = state.rate_limiter.clone();
    let mut shutdown_rx = shutdown_rx.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sessions = csrf_store.purge_expired();
                    let windows = limiter.purge_elapsed();
                    debug!(target: "http", sessions, windows, "background sweep");
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Start a server from a fully-assembled [`ServerConfig`].
///
/// Returns a [`ServerHandle`] that exposes the actual bound address and
/// provides a [`ServerHandle::shutdown`] method for clean teardown.
pub async fn run_server_with_config(config: ServerConfig) -> std::io::Result<ServerHandle> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = create_router_with_state(config.state.clone(), &config.middleware_config);

    if config.spawn_background_tasks {
        spawn_background_tasks(&config.state, DEFAULT_SWEEP_INTERVAL, &shutdown_rx);
    }

    // Bind TCP listener (supports port 0 for ephemeral port assignment)
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;
    info!(target: "http", address = %local_addr, "metafetch listening");

    // Spawn axum::serve as a background tokio task with graceful shutdown
    let mut shutdown_watch = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            // Wait until the shutdown channel is set to true
            loop {
                if *shutdown_watch.borrow() {
                    break;
                }
                if shutdown_watch.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        state: config.state,
        server_task,
    })
}
