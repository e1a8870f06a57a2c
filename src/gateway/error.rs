//! Error taxonomy for the connection gateway

use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::ProtocolError;

/// Listener lifecycle errors returned by [`start()`](super::WebSocketGateway::start)
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway already started; call close() before starting again")]
    AlreadyStarted,

    #[error("gateway has been closed; construct a new instance to listen again")]
    Closed,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Errors returned by [`send()`](super::WebSocketGateway::send)
#[derive(Debug, Error)]
pub enum SendError {
    #[error("no active connection")]
    NoConnection,

    #[error("connection not ready")]
    NotReady,

    #[error("message serialization failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("socket write failed: {0}")]
    Write(#[from] tungstenite::Error),
}

/// Normalized fault value delivered to the registered error callback.
///
/// Frame-level decode faults are recovered locally (the frame is dropped and
/// the connection stays up); bind and socket faults are informational at this
/// layer and trigger no automatic recovery.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    #[error("frame decode failed: {0}")]
    Decode(#[from] ProtocolError),

    #[error("websocket error: {0}")]
    Socket(#[from] tungstenite::Error),
}
