//! Presence and character-sharing relay for the character sheet creator.
//!
//! Clients hold one WebSocket each, register a display name, see who else is
//! online and push character payloads to every other connected client.

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::info;
use uuid::Uuid;

pub mod cli;
pub mod client;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod ws;

#[cfg(test)]
mod e2e_tests;

use config::ServerConfig;
use metrics::ServerMetrics;
use ws::{Hub, HubHandle};

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    /// Server runtime configuration
    pub server_config: Arc<ServerConfig>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

impl AppState {
    /// Spawn the share hub. It stops when `cancel` fires.
    pub fn new(server_config: ServerConfig, cancel: CancellationToken) -> Self {
        let metrics = Arc::new(ServerMetrics::new());
        let hub = Hub::spawn(server_config.sweep_interval, metrics.clone(), cancel);
        Self {
            hub,
            server_config: Arc::new(server_config),
            metrics,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let ws_path = state.server_config.ws_path.clone();
    Router::new()
        .route("/api/ping", get(handlers::ping_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route(&ws_path, get(handlers::share_websocket_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, server_config: ServerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let ws_path = server_config.ws_path.clone();
    let state = AppState::new(server_config, cancel.clone());
    let app = build_router(state);

    let addr = listener.local_addr()?;
    info!("Character share relay listening on http://{}", addr);
    info!("  WS     {}        - Share socket", ws_path);
    info!("  GET    /api/ping  - Ping");
    info!("  GET    /health    - Health summary");
    info!("  GET    /metrics   - Metrics snapshot");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    cancel.cancel();
    info!("Shutdown complete");
    result
}
