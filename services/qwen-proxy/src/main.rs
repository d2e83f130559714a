//! Qwen credential-pool proxy
//!
//! Single-binary service that:
//! 1. Manages a pool of Qwen OAuth tokens (device-flow acquisition, refresh,
//!    eviction) persisted in SQLite
//! 2. Fronts the Qwen chat-completions API behind a shared bearer password
//! 3. Streams or buffers upstream responses and accounts per-token and
//!    per-model usage

mod admin;
mod auth;
mod config;
mod dispatcher;
mod error;
mod metrics;
mod openai;
mod routes;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use qwen_auth::OAuthCoordinator;
use qwen_pool::{RefreshScheduler, TokenPool, VersionProbe};
use qwen_store::Store;

use crate::config::Settings;
use crate::dispatcher::Dispatcher;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().context("failed to load configuration")?;
    init_tracing(settings.debug);

    info!("starting qwen-code-proxy");
    info!(
        host = %settings.host,
        port = settings.port,
        database = %settings.database_path.display(),
        scheduler_enabled = settings.scheduler_enabled,
        refresh_interval_min = settings.refresh_interval_min,
        tz = %settings.tz,
        "configuration loaded"
    );

    let store = Arc::new(
        Store::open(&settings.database_path)
            .await
            .with_context(|| {
                format!("failed to open database at {}", settings.database_path.display())
            })?,
    );

    let token_client = reqwest::Client::new();
    let version = Arc::new(VersionProbe::new(store.clone(), token_client.clone()));
    let pool = Arc::new(TokenPool::new(
        store.clone(),
        settings.oauth.clone(),
        token_client.clone(),
        version.clone(),
        settings.tz,
    ));
    let coordinator = Arc::new(OAuthCoordinator::new(settings.oauth.clone(), token_client));
    let dispatcher = Arc::new(Dispatcher::new(
        settings.api_endpoint.clone(),
        pool.clone(),
        store.clone(),
        version.clone(),
        settings.tz,
    ));

    pool.reload().await.context("failed to load token pool")?;
    info!(tokens = pool.len().await, "token pool loaded");

    let initial_version = version.version().await;
    info!(version = %initial_version, "upstream client version resolved");

    let scheduler = if settings.scheduler_enabled {
        let scheduler = Arc::new(RefreshScheduler::new(
            pool.clone(),
            version.clone(),
            settings.refresh_interval_min,
        ));
        scheduler.start().await;
        Some(scheduler)
    } else {
        info!("refresh scheduler disabled by configuration");
        None
    };

    let bind_addr = format!("{}:{}", settings.host, settings.port);
    let app_state = AppState {
        settings: Arc::new(settings),
        store,
        pool,
        coordinator,
        version,
        scheduler: scheduler.clone(),
        dispatcher,
    };

    let app = build_router(app_state);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;
    info!(addr = %bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }

    info!("shutdown complete");
    Ok(())
}

/// JSON logs by default (`LOG_LEVEL` / `RUST_LOG` filtered); human-readable
/// output when DEBUG is set.
fn init_tracing(debug: bool) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    let registry = tracing_subscriber::registry().with(filter);
    if debug {
        registry.with(tracing_subscriber::fmt::layer()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
