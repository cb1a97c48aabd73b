//! Host registry: tracks connected hosts and the objects they expose.
//!
//! The [`HostRegistry`] is a thread-safe table shared between the discovery
//! sessions of a [`TcpTransport`](crate::client::TcpTransport) and its
//! per-request connections, which use it to route a [`TransportId`] to the
//! host that owns the object.

use chrono::{DateTime, Utc};
use remora_types::object::TransportId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Build the transport id of `object` on host `node_id`.
pub fn transport_id_for(node_id: &str, object: &str) -> TransportId {
    TransportId(format!("{node_id}/{object}"))
}

/// Split a transport id into `(node_id, object)`.
pub fn split_transport_id(id: &TransportId) -> Option<(&str, &str)> {
    id.as_str()
        .split_once('/')
        .filter(|(node, object)| !node.is_empty() && !object.is_empty())
}

/// Connection state of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Discovery session established.
    Connected,
    /// Session lost; kept so a later discovery round can reconnect.
    Disconnected,
}

/// A single known host.
#[derive(Debug, Clone)]
pub struct HostEntry {
    /// Unique node ID of the host.
    pub node_id: String,
    /// Human-readable node name.
    pub node_name: String,
    /// Socket address the host listens on.
    pub address: SocketAddr,
    /// Names of the objects the host currently exposes.
    pub objects: Vec<String>,
    pub state: HostState,
    pub connected_at: DateTime<Utc>,
    /// Protocol version negotiated during handshake.
    pub protocol_version: u32,
}

/// Thread-safe registry of all known hosts.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    hosts: Arc<RwLock<HashMap<String, HostEntry>>>,
}

impl HostRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            hosts: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register or update a host after a successful handshake.
    pub fn add_host(&self, entry: HostEntry) {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.insert(entry.node_id.clone(), entry);
    }

    /// Mark a host as disconnected and forget its objects.
    ///
    /// Returns the objects it exposed, so the caller can withdraw them.
    pub fn mark_disconnected(&self, node_id: &str) -> Vec<String> {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        match hosts.get_mut(node_id) {
            Some(entry) => {
                entry.state = HostState::Disconnected;
                std::mem::take(&mut entry.objects)
            }
            None => Vec::new(),
        }
    }

    /// Get a snapshot of a specific host.
    pub fn get_host(&self, node_id: &str) -> Option<HostEntry> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.get(node_id).cloned()
    }

    /// Get all connected hosts.
    pub fn connected_hosts(&self) -> Vec<HostEntry> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts
            .values()
            .filter(|h| h.state == HostState::Connected)
            .cloned()
            .collect()
    }

    /// Record a newly announced object. Returns false if it was already known.
    pub fn add_object(&self, node_id: &str, object: &str) -> bool {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        match hosts.get_mut(node_id) {
            Some(entry) if !entry.objects.iter().any(|o| o == object) => {
                entry.objects.push(object.to_string());
                true
            }
            _ => false,
        }
    }

    /// Forget a withdrawn object. Returns false if it was not known.
    pub fn remove_object(&self, node_id: &str, object: &str) -> bool {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        match hosts.get_mut(node_id) {
            Some(entry) => {
                let before = entry.objects.len();
                entry.objects.retain(|o| o != object);
                entry.objects.len() != before
            }
            None => false,
        }
    }

    /// Resolve a transport id to the address of its (connected) host.
    pub fn resolve(&self, id: &TransportId) -> Option<(SocketAddr, String)> {
        let (node_id, object) = split_transport_id(id)?;
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        let host = hosts.get(node_id)?;
        if host.state != HostState::Connected || !host.objects.iter().any(|o| o == object) {
            return None;
        }
        Some((host.address, object.to_string()))
    }

    /// Number of connected hosts.
    pub fn connected_count(&self) -> usize {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts
            .values()
            .filter(|h| h.state == HostState::Connected)
            .count()
    }

    /// Total number of hosts (including disconnected).
    pub fn total_count(&self) -> usize {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.len()
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_host(node_id: &str, objects: &[&str]) -> HostEntry {
        HostEntry {
            node_id: node_id.to_string(),
            node_name: format!("{node_id}-name"),
            address: "127.0.0.1:9000".parse().unwrap(),
            objects: objects.iter().map(|s| s.to_string()).collect(),
            state: HostState::Connected,
            connected_at: Utc::now(),
            protocol_version: 1,
        }
    }

    #[test]
    fn test_transport_id_roundtrip() {
        let id = transport_id_for("node-1", "TestSample1");
        assert_eq!(id.as_str(), "node-1/TestSample1");
        assert_eq!(split_transport_id(&id), Some(("node-1", "TestSample1")));
        assert_eq!(split_transport_id(&TransportId::new("no-slash")), None);
        assert_eq!(split_transport_id(&TransportId::new("node/")), None);
    }

    #[test]
    fn test_resolve_requires_connected_host_and_object() {
        let registry = HostRegistry::new();
        registry.add_host(make_host("node-1", &["TestSample1"]));

        let id = transport_id_for("node-1", "TestSample1");
        let (addr, object) = registry.resolve(&id).unwrap();
        assert_eq!(addr.port(), 9000);
        assert_eq!(object, "TestSample1");

        assert!(registry
            .resolve(&transport_id_for("node-1", "Missing"))
            .is_none());

        let dropped = registry.mark_disconnected("node-1");
        assert_eq!(dropped, vec!["TestSample1".to_string()]);
        assert!(registry.resolve(&id).is_none());
        assert_eq!(registry.connected_count(), 0);
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_add_remove_object() {
        let registry = HostRegistry::new();
        registry.add_host(make_host("node-1", &[]));

        assert!(registry.add_object("node-1", "Clock"));
        assert!(!registry.add_object("node-1", "Clock"));
        assert_eq!(registry.get_host("node-1").unwrap().objects.len(), 1);

        assert!(registry.remove_object("node-1", "Clock"));
        assert!(!registry.remove_object("node-1", "Clock"));
        assert!(!registry.add_object("node-2", "Clock"));
    }
}
