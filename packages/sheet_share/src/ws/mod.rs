//! Share WebSocket
//!
//! Presence tracking and character fan-out between connected sheets:
//! - Registry of live connections and their identities
//! - Hub actor that serializes every mutation and broadcast
//! - Router for the two client message kinds

mod broadcast;
pub(crate) mod dispatch;
mod handler;
mod hub;
mod protocol;
mod registry;

// Re-export the main types and functions
pub use broadcast::PresenceBroadcaster;
pub use handler::handle_share_ws;
pub use hub::{Hub, HubEvent, HubHandle, MIN_OUTBOX_CAPACITY};
pub use protocol::{
    ANONYMOUS_SHARER, ClientMessage, PresenceAction, ProtocolError, ServerMessage,
    parse_client_frame,
};
pub use registry::{ConnectionRegistry, PresenceDelta};
