use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::AppState;
use crate::ws;

/// Upgrade to the share socket
pub async fn share_websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    let hub = state.hub.clone();
    let server_config = state.server_config.clone();
    let metrics = state.metrics.clone();

    ws.max_message_size(server_config.max_message_bytes)
        .on_upgrade(move |socket| ws::handle_share_ws(socket, hub, server_config, metrics))
}
