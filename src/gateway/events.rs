//! Callback surface exposed to the RPC layer above the transport
//!
//! The gateway signals a fixed set of event kinds: connect, message, close,
//! error. Handlers are optional and may be registered before or after
//! `start()`; an event with no registered handler is silently dropped.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use super::error::TransportError;
use crate::protocol::JsonRpcMessage;

/// Identifies the connection currently occupying the gateway's single slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle {
    /// Unique id assigned when the connection was accepted
    pub id: Uuid,
    /// Remote peer address
    pub peer: SocketAddr,
}

pub type ConnectFn = Arc<dyn Fn(ConnectionHandle) + Send + Sync>;
pub type MessageFn = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;
pub type CloseFn = Arc<dyn Fn() + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(TransportError) + Send + Sync>;

/// Registered handlers for the gateway's event kinds.
///
/// Dispatch clones the handler out of the lock before invoking it, so a
/// handler may re-register any event kind (its own included) from inside the
/// callback without deadlocking.
#[derive(Default)]
pub(crate) struct EventHandlers {
    connect: RwLock<Option<ConnectFn>>,
    message: RwLock<Option<MessageFn>>,
    close: RwLock<Option<CloseFn>>,
    error: RwLock<Option<ErrorFn>>,
}

impl EventHandlers {
    pub(crate) fn set_connect(&self, handler: ConnectFn) {
        if let Ok(mut slot) = self.connect.write() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn set_message(&self, handler: MessageFn) {
        if let Ok(mut slot) = self.message.write() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn set_close(&self, handler: CloseFn) {
        if let Ok(mut slot) = self.close.write() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn set_error(&self, handler: ErrorFn) {
        if let Ok(mut slot) = self.error.write() {
            *slot = Some(handler);
        }
    }

    pub(crate) fn connected(&self, handle: ConnectionHandle) {
        let handler = self.connect.read().ok().and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler(handle);
        }
    }

    pub(crate) fn message(&self, message: JsonRpcMessage) {
        let handler = self.message.read().ok().and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler(message);
        }
    }

    pub(crate) fn closed(&self) {
        let handler = self.close.read().ok().and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler();
        }
    }

    pub(crate) fn error(&self, error: TransportError) {
        let handler = self.error.read().ok().and_then(|slot| slot.clone());
        if let Some(handler) = handler {
            handler(error);
        }
    }
}
