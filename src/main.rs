//! metrics-cache-tier: adaptive compressed cache for metrics query results.
//!
//! Serves lookups from a volatile in-process tier backed by a durable tier
//! (in-memory or on-disk), choosing a codec per payload:
//!   none | dictionary | hybrid (structural + zstd) | adaptive (blocked zstd)
//!
//! Exposes a small JSON HTTP API plus Prometheus metrics.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use metrics_cache_tier::cache::CacheCoordinator;
use metrics_cache_tier::config::{Cli, Config};
use metrics_cache_tier::server::cache_api::{build_router, AppState};
use metrics_cache_tier::storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "metrics_cache_tier=debug,tower_http=debug"
    } else {
        "metrics_cache_tier=info,tower_http=info"
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
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

    info!("metrics-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    let config = Arc::new(config);

    info!(
        threshold = config.cache.compression_threshold,
        default_ttl_ms = config.cache.default_ttl_ms,
        volatile_capacity = config.store.volatile_capacity,
        durable = ?config.store.durable,
        "Configuration loaded"
    );

    // Open the durable tier and build the coordinator.
    let durable = storage::open(&config.store.durable).await?;
    let coordinator = Arc::new(CacheCoordinator::new(config.clone(), durable)?);
    let sweeper = coordinator.spawn_sweeper();

    let state = Arc::new(AppState {
        coordinator,
        config: config.clone(),
        start_time: Instant::now(),
    });
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    sweeper.shutdown().await;
    Ok(())
}
