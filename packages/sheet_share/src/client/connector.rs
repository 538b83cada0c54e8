//! Transport seam for the reconnecting client.
//!
//! The controller only sees text frames and close notifications, so tests can
//! drive it with in-memory channels instead of a socket.

use futures::{Sink, SinkExt, Stream, StreamExt, future};
use std::future::Future;
use std::pin::Pin;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

use super::error::ClientError;

/// Frame received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Server closed the connection, with its close code if one was sent
    Close(Option<u16>),
}

/// Frame sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    /// Normal (1000) closure
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Outbound, Error = ClientError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Inbound, ClientError>> + Send>>;

/// One established connection, split into its two halves.
pub struct Transport {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens a fresh connection each time the controller (re)connects.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Transport, ClientError>> + Send;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    async fn connect(&self) -> Result<Transport, ClientError> {
        debug!(url = %self.url, "Connecting");
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(ClientError::from_tungstenite)?;
        let (ws_write, ws_read) = ws_stream.split();

        let sink = ws_write
            .sink_map_err(ClientError::from_tungstenite)
            .with(|frame: Outbound| future::ready(Ok::<_, ClientError>(to_message(frame))));

        let stream = ws_read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text.as_str().to_owned()))),
                Ok(Message::Binary(data)) => Some(Ok(Inbound::Text(
                    String::from_utf8_lossy(&data).into_owned(),
                ))),
                Ok(Message::Close(frame)) => {
                    Some(Ok(Inbound::Close(frame.map(|f| u16::from(f.code)))))
                }
                // tungstenite answers pings itself
                Ok(_) => None,
                Err(e) => Some(Err(ClientError::from_tungstenite(e))),
            })
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Close => Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "client closing".into(),
        })),
    }
}
