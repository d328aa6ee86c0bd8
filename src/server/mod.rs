//! HTTP query/command API and the per-run event WebSocket.

pub mod api;
pub mod ws;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::RunwayConfig;
use crate::events::EventHub;
use crate::orchestrator::{RunLauncher, RunOrchestrator};
use crate::store::SqliteRunStore;

pub use api::{ApiError, AppState, SharedState};

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/runs/{id}", get(ws::run_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until ctrl-c, resuming unfinished runs first.
pub async fn start_server(config: &RunwayConfig) -> Result<()> {
    let store = SqliteRunStore::open(&config.database.path)?;
    let hub = Arc::new(EventHub::new());
    let orchestrator = Arc::new(RunOrchestrator::from_config(config, store, hub.clone())?);
    let launcher = RunLauncher::new(orchestrator);

    let resumed = launcher.resume_unfinished().await?;
    if resumed > 0 {
        info!(count = resumed, "resumed unfinished runs");
    }

    let state = Arc::new(AppState {
        launcher: launcher.clone(),
        hub,
    });
    let app = build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, db = %config.database.path.display(), "runway server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    launcher.shutdown().await;
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
