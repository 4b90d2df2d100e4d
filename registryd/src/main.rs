mod api;
mod config;
mod registry;
mod registry_manager;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use shared::clock::SystemClock;
use crate::config::Config;
use crate::registry_manager::RegistryHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("registryd=info"))
        )
        .init();

    tracing::info!("Starting registryd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/registryd/registryd.toml".to_string());

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!(
        "Sweeping every {}s, default heartbeat interval {}s",
        config.registry.sweep_interval_secs,
        config.registry.default_heartbeat_interval_secs
    );
    if !config.registry.strict_heartbeat {
        tracing::info!("Heartbeats from unknown instances will register them");
    }

    // Membership hash starts from the empty registry
    let (hash_tx, hash_rx) = watch::channel(registry::hash::compute_hash(&[]));

    // Start registry thread
    let registry = RegistryHandle::spawn(&config.registry, Arc::new(SystemClock), hash_tx);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn sweep task
    let sweep_cancel = cancel.clone();
    let sweep_config = config.registry.clone();
    let sweep_registry = registry.clone();
    let sweep_handle = tokio::spawn(async move {
        if let Err(e) = registry_manager::run(sweep_registry, sweep_config, sweep_cancel).await {
            tracing::error!("Sweep loop error: {}", e);
        }
    });

    // Build API router
    let app_state = api::routes::AppState {
        registry: registry.clone(),
        hash_rx,
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown; peer addresses identify instances
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_cancel.cancelled().await })
        .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(sweep_handle, server_handle);

    // Shutdown registry thread
    if let Err(e) = registry.shutdown().await {
        tracing::error!("Failed to shutdown registry: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
