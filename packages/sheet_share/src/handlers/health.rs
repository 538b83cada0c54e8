use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::AppState;
use crate::metrics;

/// Legacy ping endpoint kept for existing front-ends
pub async fn ping_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "message": "Character share server is running",
    }))
}

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> Response {
    let metrics = state.metrics.snapshot();

    match state.hub.online_users().await {
        Ok(users) => Json(metrics::HealthStatus {
            status: "healthy".to_string(),
            connections: metrics.connections.active,
            online_users: users.len() as u64,
            uptime_secs: metrics.uptime_secs,
        })
        .into_response(),
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(metrics::HealthStatus {
                status: "degraded".to_string(),
                connections: metrics.connections.active,
                online_users: 0,
                uptime_secs: metrics.uptime_secs,
            }),
        )
            .into_response(),
    }
}

/// Metrics endpoint - returns detailed server metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}
