use tokio_tungstenite::tungstenite;

use super::controller::ConnectionState;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("outbound queue is full")]
    Backpressure,

    #[error("client has stopped")]
    Stopped,

    #[error("server is unavailable")]
    Unavailable,

    #[error("failed to encode message")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl ClientError {
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        let is_connect = match &err {
            tungstenite::Error::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        };
        if is_connect {
            Self::Unavailable
        } else {
            Self::Transport(err.into())
        }
    }
}
