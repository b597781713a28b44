use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gatekeeper::bruteforce::BruteForceProtection;
use gatekeeper::clock::SystemClock;
use gatekeeper::config::{GuardConfig, LogFormat, LoggingConfig, StoreBackend, StoreConfig};
use gatekeeper::http::{
    admin_router, api_router, AdminState, AppState, ClientAddress, HttpServer, LoginGuard,
    RateLimitState,
};
use gatekeeper::ratelimit::Policies;
use gatekeeper::store::{CounterStore, MemoryStore, RedisStore, TimeoutStore};

/// Distributed rate limiting and brute-force protection service.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "GATEKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Public API address, overrides `server.http_addr`
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Admin API address, overrides `server.admin_addr`
    #[arg(long)]
    admin_addr: Option<SocketAddr>,

    /// Redis URL; selects the redis backend
    #[arg(long)]
    store_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = GuardConfig::load(cli.config.as_deref())?;
    if let Some(addr) = cli.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(addr) = cli.admin_addr {
        config.server.admin_addr = addr;
    }
    if let Some(url) = cli.store_url {
        config.store.backend = StoreBackend::Redis;
        config.store.url = url;
    }

    init_tracing(&config.logging);

    info!("Starting Gatekeeper");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        admin_addr = %config.server.admin_addr,
        backend = ?config.store.backend,
        "Configuration loaded"
    );

    let store = build_store(&config.store).await?;
    let clock = Arc::new(SystemClock);

    let policies = Policies::build(
        &config.rate_limiting.resolve_policies()?,
        store.clone(),
        clock.clone(),
    )?;
    let rate_limit = Arc::new(
        RateLimitState::new(
            policies,
            ClientAddress::new(&config.rate_limiting.platform_header)?,
        )
        .expose_headers(config.rate_limiting.expose_headers),
    );
    info!("Rate limiter initialized");

    let protection = Arc::new(BruteForceProtection::with_clock(
        store.clone(),
        config.brute_force.clone(),
        clock,
    )?);
    info!(
        max_attempts = config.brute_force.max_attempts,
        "Brute-force protection initialized"
    );

    if config.users.is_empty() {
        warn!("No users configured; every login will be rejected");
    }

    let app = AppState::new(
        LoginGuard::new(protection.clone()),
        rate_limit.clone(),
        config.users.clone(),
        store.clone(),
    );
    let admin = AdminState {
        store,
        protection,
        rate_limit,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let api_server = HttpServer::new("api", config.server.http_addr, api_router(Arc::new(app)));
    let admin_server = HttpServer::new("admin", config.server.admin_addr, admin_router(admin));

    let api = tokio::spawn(api_server.serve_with_shutdown(wait_for(shutdown_rx.clone())));
    let admin = tokio::spawn(admin_server.serve_with_shutdown(wait_for(shutdown_rx)));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("api", api), ("admin", admin)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(server = name, error = %e, "Server exited with an error"),
            Err(e) => error!(server = name, error = %e, "Server task failed"),
        }
    }

    info!("Gatekeeper stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Connect the configured backend and bound every call on it.
async fn build_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    let timeout = Duration::from_millis(config.timeout_ms);

    let store: Arc<dyn CounterStore> = match config.backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; limits are not shared between instances");
            let memory = Arc::new(MemoryStore::new(Arc::new(SystemClock)));
            spawn_sweeper(memory.clone(), Duration::from_secs(config.sweep_interval_secs));
            Arc::new(TimeoutStore::new(memory, timeout))
        }
        StoreBackend::Redis => {
            let redis = RedisStore::connect(&config.url).await?;
            info!(url = %config.url, "Connected to Redis");
            Arc::new(TimeoutStore::new(redis, timeout))
        }
    };
    Ok(store)
}

/// Periodically drop expired keys from the in-memory store.
fn spawn_sweeper(store: Arc<MemoryStore>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            store.sweep_expired();
        }
    });
}

async fn wait_for(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
