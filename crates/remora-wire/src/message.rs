//! Wire protocol message types.
//!
//! Controllers and hosts exchange JSON-framed messages over TCP. Each
//! message is prefixed with a 4-byte big-endian length header.

use remora_types::object::{ObjectDescriptor, Value};
use serde::{Deserialize, Serialize};

/// A wire protocol message (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Unique message ID. Responses echo the request ID.
    pub id: String,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

impl WireMessage {
    /// Wrap a kind in an envelope with a fresh ID.
    pub fn new(kind: WireMessageKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
        }
    }

    /// Build the response envelope for a request.
    pub fn reply(request_id: &str, response: WireResponse) -> Self {
        Self {
            id: request_id.to_string(),
            kind: WireMessageKind::Response(response),
        }
    }
}

/// The different kinds of wire messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    /// Request from a controller to a host.
    #[serde(rename = "request")]
    Request(WireRequest),
    /// Response to a request.
    #[serde(rename = "response")]
    Response(WireResponse),
    /// One-way notification pushed by a host (no response expected).
    #[serde(rename = "notification")]
    Notification(WireNotification),
}

/// Request messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireRequest {
    /// Handshake: exchange node identity.
    #[serde(rename = "handshake")]
    Handshake {
        node_id: String,
        node_name: String,
        protocol_version: u32,
        /// Random nonce for HMAC authentication.
        #[serde(default)]
        nonce: String,
        /// HMAC-SHA256(shared_secret, nonce + node_id).
        #[serde(default)]
        auth_hmac: String,
    },
    /// List the host's objects and subscribe this connection to notifications.
    #[serde(rename = "discover")]
    Discover,
    /// Invoke a published method.
    #[serde(rename = "invoke")]
    Invoke {
        object: String,
        operation: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Read a published attribute.
    #[serde(rename = "get_attribute")]
    GetAttribute { object: String, name: String },
    /// Write a published attribute.
    #[serde(rename = "set_attribute")]
    SetAttribute {
        object: String,
        name: String,
        value: Value,
    },
    /// Ask an object to shut down.
    #[serde(rename = "quit")]
    Quit { object: String },
    /// Liveness check.
    #[serde(rename = "ping")]
    Ping,
}

/// Response messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum WireResponse {
    /// Handshake acknowledgement.
    #[serde(rename = "handshake_ack")]
    HandshakeAck {
        node_id: String,
        node_name: String,
        protocol_version: u32,
        #[serde(default)]
        nonce: String,
        #[serde(default)]
        auth_hmac: String,
    },
    /// Objects currently exposed by the host.
    #[serde(rename = "discover_result")]
    DiscoverResult { objects: Vec<ObjectDescriptor> },
    /// Result of an invocation or attribute access.
    #[serde(rename = "return")]
    Return { value: Value },
    /// The object accepted the quit request.
    #[serde(rename = "quit_ack")]
    QuitAck,
    /// Pong response.
    #[serde(rename = "pong")]
    Pong {
        /// Uptime in seconds.
        uptime_secs: u64,
    },
    /// Error response.
    #[serde(rename = "error")]
    Error { code: i32, message: String },
}

/// Notification messages (one-way, host → subscribed controllers).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WireNotification {
    /// A new object became available on the host.
    #[serde(rename = "object_announced")]
    ObjectAnnounced { object: ObjectDescriptor },
    /// An object is gone.
    #[serde(rename = "object_withdrawn")]
    ObjectWithdrawn { object: String },
    /// An attribute changed value on the host.
    #[serde(rename = "attribute_updated")]
    AttributeUpdated {
        object: String,
        name: String,
        value: Value,
    },
    /// Host is shutting down; all its objects are gone.
    #[serde(rename = "shutting_down")]
    ShuttingDown,
}

/// Error codes carried in [`WireResponse::Error`].
pub mod codes {
    pub const VERSION_MISMATCH: i32 = 1;
    pub const BAD_REQUEST: i32 = 400;
    pub const UNAUTHENTICATED: i32 = 401;
    pub const FORBIDDEN: i32 = 403;
    pub const UNKNOWN_OBJECT: i32 = 404;
    pub const OBJECT_FAILURE: i32 = 500;
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Encode a wire message to bytes (4-byte big-endian length + JSON).
pub fn encode_message(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(msg)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a WireMessage.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}
