//! The collaborator interface consumed by the dispatcher.
//!
//! A [`Transport`] finds remote objects and carries method/attribute traffic
//! to them. It reports what it finds as [`TransportEvent`]s on a channel the
//! dispatcher hands over in [`Transport::start_discovery`]; events may be sent
//! from any task.

use async_trait::async_trait;
use remora_types::error::RemoraError;
use remora_types::object::{ObjectDescriptor, TransportId, Value};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors from the transport layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("Unknown object: {0}")]
    UnknownObject(TransportId),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<WireError> for RemoraError {
    fn from(e: WireError) -> Self {
        RemoraError::TransportFault(e.to_string())
    }
}

/// Something the transport observed about remote objects.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A remote object is available.
    Announced {
        descriptor: ObjectDescriptor,
        transport_id: TransportId,
    },
    /// A remote object is gone (withdrawn, timed out or its host went away).
    Withdrawn { transport_id: TransportId },
    /// A remote object published a new attribute value.
    AttributeUpdated {
        transport_id: TransportId,
        name: String,
        value: Value,
    },
}

/// Channel the transport reports events on.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Network collaborator used by the dispatcher.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Begin (or restart) looking for remote objects, reporting on `events`.
    async fn start_discovery(&self, events: EventSink) -> Result<(), WireError>;

    /// Stop looking for new objects. Already-known objects remain reachable.
    async fn stop_discovery(&self);

    /// Invoke a named operation on a remote object.
    async fn invoke(
        &self,
        target: &TransportId,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, WireError>;

    /// Fetch the current value of a remote attribute.
    async fn get_attribute(&self, target: &TransportId, name: &str) -> Result<Value, WireError>;

    /// Write a remote attribute; returns the value the remote accepted.
    async fn set_attribute(
        &self,
        target: &TransportId,
        name: &str,
        value: Value,
    ) -> Result<Value, WireError>;

    /// Ask the remote object to shut down and wait for its acknowledgement.
    ///
    /// Implementations may wait indefinitely; callers bound the wait.
    async fn notify_quit(&self, target: &TransportId) -> Result<(), WireError>;
}
