//! Reconnecting share client
//!
//! Client-side half of the share socket: a controller that keeps a session
//! alive across disconnects and a pluggable transport underneath it.

mod backoff;
mod connector;
mod controller;
mod error;

pub use backoff::ReconnectPolicy;
pub use connector::{Connector, FrameSink, FrameStream, Inbound, Outbound, Transport, WsConnector};
pub use controller::{ClientHandle, ConnectionState, ControllerEvent, ReconnectingClient};
pub use error::ClientError;
