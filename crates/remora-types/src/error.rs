//! Shared error types for the Remora system.

use crate::object::{ProxyId, TransportId};
use thiserror::Error;

/// Top-level error type for proxy, timer and discovery operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoraError {
    /// The proxy id is unknown, or the proxy is not in a state that allows the operation.
    #[error("Invalid proxy: {0}")]
    InvalidProxy(ProxyId),

    /// Timer periods must be at least one millisecond.
    #[error("Invalid timer interval: {0} ms")]
    InvalidInterval(u64),

    /// The transport announced an object that is already registered and live.
    #[error("Duplicate registration for transport id {0}")]
    DuplicateRegistration(TransportId),

    /// The transport collaborator reported a failure.
    #[error("Transport fault: {0}")]
    TransportFault(String),

    /// A remote acknowledgement or response did not arrive in time.
    #[error("Timed out after {waited_ms} ms waiting for {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The remote object does not publish a method with this name.
    #[error("Object '{object}' has no operation '{operation}'")]
    UnknownOperation {
        /// The remote object's name.
        object: String,
        /// The requested operation.
        operation: String,
    },

    /// The remote object does not publish an attribute with this name.
    #[error("Object '{object}' has no attribute '{attribute}'")]
    UnknownAttribute {
        /// The remote object's name.
        object: String,
        /// The requested attribute.
        attribute: String,
    },

    /// Arguments or values do not match the published signature.
    #[error("Argument mismatch for '{operation}': {reason}")]
    ArgumentMismatch {
        /// The operation or attribute being called.
        operation: String,
        /// What was wrong.
        reason: String,
    },

    /// Attempted to write a read-only attribute.
    #[error("Attribute '{attribute}' of '{object}' is read-only")]
    ReadOnlyAttribute {
        /// The remote object's name.
        object: String,
        /// The attribute.
        attribute: String,
    },

    /// The registry already holds the configured maximum number of proxies.
    #[error("Proxy registry is full ({0} proxies)")]
    RegistryFull(usize),

    /// The dispatcher has been shut down by `quit()`.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Alias for Result with RemoraError.
pub type RemoraResult<T> = Result<T, RemoraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RemoraError::InvalidProxy(ProxyId(7));
        assert_eq!(err.to_string(), "Invalid proxy: 7");

        let err = RemoraError::Timeout {
            operation: "quit ack".to_string(),
            waited_ms: 250,
        };
        assert_eq!(err.to_string(), "Timed out after 250 ms waiting for quit ack");
    }

    #[test]
    fn test_duplicate_registration_names_transport_id() {
        let err = RemoraError::DuplicateRegistration(TransportId::new("node-1/Clock"));
        assert!(err.to_string().contains("node-1/Clock"));
    }
}
