//! Remora transport collaborators.
//!
//! The dispatcher in `remora-kernel` only sees the [`Transport`] trait. This
//! crate ships two implementations of it plus the remote side they talk to.
//!
//! ## Architecture
//!
//! - **Transport**: The interface the dispatcher consumes
//! - **HostNode**: Listens for controllers and exposes an [`ObjectHost`]'s objects
//! - **TcpTransport**: Controller side; one discovery session per seed host
//! - **HostRegistry**: Tracks known hosts and the objects they expose
//! - **MemoryTransport**: In-process transport for tests and demos
//! - **WireMessage**: JSON-framed protocol messages

pub mod client;
pub mod conn;
pub mod host;
pub mod memory;
pub mod message;
pub mod registry;
pub mod transport;

pub use client::TcpTransport;
pub use host::{HostConfig, HostNode, HostNotifier, ObjectHost};
pub use memory::{MemoryTransport, QuitBehavior, RecordedCall};
pub use message::{WireMessage, WireNotification, WireRequest, WireResponse};
pub use registry::{HostEntry, HostRegistry};
pub use transport::{EventSink, Transport, TransportEvent, WireError};
