//! Connection gateway module
//!
//! The server-side WebSocket transport: listener lifecycle, subprotocol
//! negotiation, the single active-connection slot, and the inbound/outbound
//! message pipelines.

mod error;
mod events;
mod transport;

pub use error::{GatewayError, SendError, TransportError};
pub use events::ConnectionHandle;
pub use transport::{GatewayConfig, WebSocketGateway, SUBPROTOCOL};
