mod api;
mod config;
mod discovery;
mod registry;
mod registry_manager;
mod view;

use std::path::Path;
use std::sync::Arc;
use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use crate::config::Config;
use crate::discovery::engine::DiscoveryEngine;
use crate::registry::db::RegistryDb;
use crate::registry_manager::RegistryHandle;

const DEFAULT_CONFIG_PATH: &str = "/etc/scoutd/scoutd.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("scoutd=info"))
        )
        .init();

    tracing::info!("Starting scoutd");

    // An explicit path must exist; the default one is optional
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let config = Config::load(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            tracing::info!("Loaded config from {}", path);
            config
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            let config = Config::load(DEFAULT_CONFIG_PATH)?;
            tracing::info!("Loaded config from {}", DEFAULT_CONFIG_PATH);
            config
        }
        None => {
            tracing::info!("No config file, using defaults");
            Config::default()
        }
    };

    // Open SQLite database
    let db = RegistryDb::open(&config.registry.db_path)?;
    tracing::info!("Opened registry at {:?}", config.registry.db_path);

    // Start registry thread
    let registry = RegistryHandle::spawn(db);

    let cancel = CancellationToken::new();

    // Spawn history retention task
    let maint_cancel = cancel.clone();
    let maint_config = config.registry.clone();
    let maint_registry = registry.clone();
    let maint_handle = tokio::spawn(async move {
        if let Err(e) = registry_manager::run(maint_registry, maint_config, maint_cancel).await {
            tracing::error!("Registry maintenance error: {}", e);
        }
    });

    // Discovery engine; a bind failure aborts startup
    let mut engine = DiscoveryEngine::new(config.discovery.clone(), registry.clone());
    let publisher = engine.publisher();
    if config.discovery.autostart {
        engine.start().await?;
    }
    publisher.publish().await?;
    let engine = Arc::new(Mutex::new(engine));

    // Build API router
    let app_state = api::routes::AppState {
        registry: registry.clone(),
        engine: engine.clone(),
        publisher,
        active_window: config.discovery.ttl(),
        shutdown: cancel.clone(),
    };
    let app = api::routes::router(app_state);

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
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

    cancel.cancel();
    let _ = tokio::join!(maint_handle, server_handle);

    engine.lock().await.stop().await;

    // Shutdown registry thread
    if let Err(e) = registry.shutdown().await {
        tracing::error!("Failed to shutdown registry: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
