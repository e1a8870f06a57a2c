//! Single-connection WebSocket server transport for MCP JSON-RPC traffic.
//!
//! The [`WebSocketGateway`] binds a listening socket, admits one peer at a
//! time through the `mcp` subprotocol gate, and exchanges JSON-RPC envelopes
//! with the RPC layer above it via registered callbacks. It carries
//! already-encoded messages only; request/response correlation, method
//! dispatch, and reconnection policy belong to the caller.

pub mod gateway;
pub mod protocol;

pub use gateway::{
    ConnectionHandle, GatewayConfig, GatewayError, SendError, TransportError, WebSocketGateway,
    SUBPROTOCOL,
};
pub use protocol::{JsonRpcMessage, ProtocolError};
