//! WebSocket Handler
//!
//! One task pair per share socket: a writer draining the connection's outbox
//! and a reader forwarding frames to the hub.

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::metrics::ServerMetrics;

use super::hub::HubHandle;
use super::protocol::ServerMessage;

/// Handle a share WebSocket connection until either side goes away.
pub async fn handle_share_ws(
    socket: WebSocket,
    hub: HubHandle,
    config: Arc<ServerConfig>,
    metrics: Arc<ServerMetrics>,
) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    info!(conn_id = %connection_id, "New share WebSocket connection");
    metrics.connection_opened();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbox: the hub only ever try_sends into this
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(config.send_queue_capacity);

    if let Err(e) = hub.open(&connection_id, tx).await {
        error!(conn_id = %connection_id, "Failed to register connection: {}", e);
        metrics.connection_closed();
        return;
    }

    // Task to send messages to WebSocket
    let ping_interval = config.ping_interval;
    let conn_id_send = connection_id.clone();
    let sender_task = async move {
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        // Hub dropped the outbox: this connection was evicted
                        debug!(conn_id = %conn_id_send, "Outbox closed");
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    };
                    let json = match serde_json::to_string(&msg) {
                        Ok(j) => j,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    // Task to handle incoming messages
    let hub_input = hub.clone();
    let conn_id_input = connection_id.clone();
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(data)) => String::from_utf8_lossy(&data).into_owned(),
                Ok(Message::Close(_)) => {
                    debug!(conn_id = %conn_id_input, "Client closed connection");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(conn_id = %conn_id_input, "WebSocket error: {}", e);
                    break;
                }
            };
            if hub_input.frame(&conn_id_input, text).await.is_err() {
                break;
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!(conn_id = %connection_id, "Writer finished"),
        _ = input_task => debug!(conn_id = %connection_id, "Reader finished"),
    }

    if let Err(e) = hub.close(&connection_id).await {
        warn!(conn_id = %connection_id, "Failed to deregister connection: {}", e);
    }
    metrics.connection_closed();
    info!(conn_id = %connection_id, "Share WebSocket connection closed");
}
