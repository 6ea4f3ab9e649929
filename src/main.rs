//! disk-lru-cache: serves a disk-backed LRU blob cache over HTTP.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use disk_lru_cache::config::{Cli, Config};
use disk_lru_cache::metrics::CacheMetrics;
use disk_lru_cache::server::http_api::{build_router, AppState};
use disk_lru_cache::DiskLruCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "disk_lru_cache=debug,tower_http=debug"
    } else {
        "disk_lru_cache=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("disk-lru-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        directory = %config.cache.directory.display(),
        capacity_bytes = config.cache.capacity_bytes,
        max_entries = ?config.cache.max_entries,
        store = ?config.cache.store,
        "Configuration loaded"
    );

    // Open the cache; the index loads in the background.
    let cache = DiskLruCache::open(config.cache.clone())?;
    let metrics = CacheMetrics::new()?;
    let state = Arc::new(AppState::new(cache.clone(), metrics));

    // Build the HTTP router.
    let app = build_router(state, config.server.max_body_bytes);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tokio::task::spawn_blocking(move || cache.close()).await??;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
