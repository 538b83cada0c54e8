//! Message Router
//!
//! Turns one inbound text frame into registry mutations and outbound
//! envelopes. Runs on the hub task, so each frame is handled to completion
//! before the next one from any connection.

use tracing::{debug, info, warn};

use super::broadcast::PresenceBroadcaster;
use super::protocol::{
    ANONYMOUS_SHARER, ClientMessage, ProtocolError, ServerMessage, parse_client_frame,
};
use super::registry::{ConnectionRegistry, PresenceDelta};

/// Everything the router needs to handle a frame from one connection.
pub(crate) struct RouterContext<'a> {
    pub connection_id: &'a str,
    pub registry: &'a mut ConnectionRegistry,
    pub broadcaster: &'a PresenceBroadcaster,
}

/// What happened to a frame, for metrics and tests.
#[derive(Debug)]
pub(crate) enum DispatchResult {
    Registered {
        username: String,
        delta: PresenceDelta,
    },
    Shared {
        delivered: usize,
    },
    /// Frame violated the protocol; one error reply was sent
    Rejected(ProtocolError),
    /// Connection was gone, or went away while the frame was handled
    Ignored,
}

/// Parse, validate and route one text frame.
pub(crate) fn dispatch_frame(ctx: &mut RouterContext<'_>, text: &str) -> DispatchResult {
    if !ctx.registry.contains(ctx.connection_id) {
        debug!(conn_id = %ctx.connection_id, "Frame from unknown connection, dropping");
        return DispatchResult::Ignored;
    }
    // Writer already gone: drop the connection before its frame changes presence
    if ctx
        .registry
        .outbox(ctx.connection_id)
        .is_some_and(|outbox| outbox.is_closed())
    {
        debug!(conn_id = %ctx.connection_id, "Frame from closed connection, evicting");
        ctx.broadcaster
            .evict(ctx.registry, vec![ctx.connection_id.to_string()]);
        return DispatchResult::Ignored;
    }

    match parse_client_frame(text) {
        Ok(msg) => dispatch_client_message(ctx, msg),
        Err(e) => {
            warn!(conn_id = %ctx.connection_id, error = %e, "Rejected client frame");
            ctx.broadcaster
                .send_to(ctx.registry, ctx.connection_id, e.to_server_message());
            DispatchResult::Rejected(e)
        }
    }
}

pub(crate) fn dispatch_client_message(
    ctx: &mut RouterContext<'_>,
    msg: ClientMessage,
) -> DispatchResult {
    match msg {
        ClientMessage::RegisterUser { username } => handle_register(ctx, username),
        ClientMessage::ShareCharacter { content, username } => {
            handle_share(ctx, content, username)
        }
    }
}

fn handle_register(ctx: &mut RouterContext<'_>, username: String) -> DispatchResult {
    let delta = ctx
        .registry
        .add_or_update_identity(ctx.connection_id, &username);
    info!(conn_id = %ctx.connection_id, username = %username, "User registered");

    let acked = ctx.broadcaster.send_to(
        ctx.registry,
        ctx.connection_id,
        ServerMessage::register_confirmed(&username),
    );
    if !acked {
        // Eviction already announced the leave and a fresh snapshot
        debug!(conn_id = %ctx.connection_id, "Registrant evicted before announce");
        return DispatchResult::Ignored;
    }
    ctx.broadcaster.announce_delta(ctx.registry, delta.clone());
    ctx.broadcaster.announce_snapshot(ctx.registry);

    DispatchResult::Registered { username, delta }
}

fn handle_share(
    ctx: &mut RouterContext<'_>,
    content: serde_json::Value,
    username: Option<String>,
) -> DispatchResult {
    let shared_by = username
        .or_else(|| {
            ctx.registry
                .identity_of(ctx.connection_id)
                .map(str::to_string)
        })
        .unwrap_or_else(|| ANONYMOUS_SHARER.to_string());

    let msg = ServerMessage::SharedCharacter { content, shared_by };
    let delivered = ctx.broadcaster.fanout(ctx.registry, &msg, ctx.connection_id);
    debug!(conn_id = %ctx.connection_id, delivered, "Character shared");

    ctx.broadcaster.send_to(
        ctx.registry,
        ctx.connection_id,
        ServerMessage::share_confirmed(delivered),
    );
    DispatchResult::Shared { delivered }
}
