//! JSON-RPC message model
//!
//! Defines the message envelopes carried over the WebSocket transport.
//! Every wire frame is the UTF-8 JSON text of exactly one envelope; anything
//! that does not match one of the four shapes below is rejected before it
//! reaches the layer above the transport.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// The only JSON-RPC version this transport carries
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("not a JSON-RPC {JSONRPC_VERSION} message: {0}")]
    Schema(String),
}

/// Marker for the `jsonrpc` field.
///
/// Serializes as the literal string `"2.0"` and refuses anything else on the
/// way in, so version checking is part of deserialization rather than a
/// separate validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version;

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(JSONRPC_VERSION)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let version = String::deserialize(deserializer)?;
        if version == JSONRPC_VERSION {
            Ok(Version)
        } else {
            Err(D::Error::custom(format!(
                "unsupported jsonrpc version: {version}"
            )))
        }
    }
}

/// Request identifier: JSON-RPC permits numbers and strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

/// A request expecting a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A fire-and-forget notification (no id, no response expected)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A successful response to an earlier request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub result: Value,
}

/// Error detail carried by an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An error response; the id is null when the request id could not be read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub jsonrpc: Version,
    #[serde(default)]
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

/// Any message the transport will carry.
///
/// Untagged: variants are tried in order, so the request shape (which has
/// both `id` and `method`) must come before the notification shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// Decode one wire frame into a validated message.
    ///
    /// Two-phase: JSON parse first, then envelope shape matching, so callers
    /// can distinguish malformed JSON from well-formed JSON that is not a
    /// JSON-RPC envelope.
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::Parse)?;
        serde_json::from_value(value).map_err(|e| ProtocolError::Schema(e.to_string()))
    }

    /// Encode the message as the JSON text of one wire frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}
