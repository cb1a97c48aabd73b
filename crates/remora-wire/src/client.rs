//! TcpTransport: the controller side of the TCP transport.
//!
//! Discovery keeps one long-lived session per seed host: handshake,
//! `Discover`, then a stream of notifications. Method and attribute traffic
//! uses a fresh authenticated connection per request so a slow call never
//! blocks the session.

use crate::conn::{client_handshake, read_message, request, NodeIdentity};
use crate::message::*;
use crate::registry::{transport_id_for, HostEntry, HostRegistry, HostState};
use crate::transport::{EventSink, Transport, TransportEvent, WireError};

use async_trait::async_trait;
use dashmap::DashMap;
use remora_types::config::NetworkConfig;
use remora_types::object::{TransportId, Value};
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Controller-side transport over TCP.
pub struct TcpTransport {
    identity: NodeIdentity,
    registry: HostRegistry,
    seeds: Mutex<Vec<SocketAddr>>,
    sessions: DashMap<SocketAddr, JoinHandle<()>>,
    /// Present while discovering.
    sink: Mutex<Option<EventSink>>,
}

impl TcpTransport {
    /// Create a transport from the `[network]` config section.
    pub fn new(network: &NetworkConfig) -> Result<Self, WireError> {
        if network.shared_secret.is_empty() {
            return Err(WireError::HandshakeFailed(
                "TcpTransport requires shared_secret. Set [network] shared_secret in config.toml"
                    .into(),
            ));
        }
        let seeds = network
            .peers
            .iter()
            .map(|p| parse_addr(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            identity: NodeIdentity {
                node_id: uuid::Uuid::new_v4().to_string(),
                node_name: network.node_name.clone(),
                shared_secret: network.shared_secret.clone(),
            },
            registry: HostRegistry::new(),
            seeds: Mutex::new(seeds),
            sessions: DashMap::new(),
            sink: Mutex::new(None),
        })
    }

    /// This controller's node ID.
    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// The table of known hosts.
    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    /// Add a seed host. Connects immediately while discovering.
    pub async fn add_peer(&self, addr: SocketAddr) {
        {
            let mut seeds = self.seeds.lock().unwrap_or_else(|e| e.into_inner());
            if !seeds.contains(&addr) {
                info!(%addr, "Added seed host");
                seeds.push(addr);
            }
        }
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(sink) = sink {
            self.ensure_session(addr, sink);
        }
    }

    /// Spawn a discovery session for `addr` unless one is already running.
    fn ensure_session(&self, addr: SocketAddr, events: EventSink) {
        if let Some(existing) = self.sessions.get(&addr) {
            if !existing.is_finished() {
                return;
            }
        }
        let identity = self.identity.clone();
        let registry = self.registry.clone();
        let handle = tokio::spawn(async move {
            match run_session(addr, &identity, &registry, &events).await {
                Ok(()) | Err(WireError::ConnectionClosed) => {
                    info!(%addr, "Discovery session ended")
                }
                Err(e) => warn!(%addr, error = %e, "Discovery session failed"),
            }
        });
        self.sessions.insert(addr, handle);
    }

    /// Open an authenticated connection to the host owning `target` and send
    /// one request built from the object's name.
    async fn call(
        &self,
        target: &TransportId,
        build: impl FnOnce(String) -> WireRequest,
    ) -> Result<WireResponse, WireError> {
        let (addr, object) = self
            .registry
            .resolve(target)
            .ok_or_else(|| WireError::UnknownObject(target.clone()))?;

        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();
        client_handshake(&mut reader, &mut writer, &self.identity).await?;

        match request(&mut reader, &mut writer, build(object)).await? {
            WireResponse::Error { code, message } => Err(WireError::Remote { code, message }),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start_discovery(&self, events: EventSink) -> Result<(), WireError> {
        let seeds = self.seeds.lock().unwrap_or_else(|e| e.into_inner()).clone();
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(events.clone());
        info!(seeds = seeds.len(), "Starting discovery");
        for addr in seeds {
            self.ensure_session(addr, events.clone());
        }
        Ok(())
    }

    async fn stop_discovery(&self) {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
        let addrs: Vec<SocketAddr> = self.sessions.iter().map(|e| *e.key()).collect();
        for addr in addrs {
            if let Some((_, handle)) = self.sessions.remove(&addr) {
                handle.abort();
            }
        }
        info!("Discovery stopped");
    }

    async fn invoke(
        &self,
        target: &TransportId,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, WireError> {
        let operation = operation.to_string();
        match self
            .call(target, |object| WireRequest::Invoke {
                object,
                operation,
                args,
            })
            .await?
        {
            WireResponse::Return { value } => Ok(value),
            other => Err(WireError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn get_attribute(&self, target: &TransportId, name: &str) -> Result<Value, WireError> {
        let name = name.to_string();
        match self
            .call(target, |object| WireRequest::GetAttribute { object, name })
            .await?
        {
            WireResponse::Return { value } => Ok(value),
            other => Err(WireError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn set_attribute(
        &self,
        target: &TransportId,
        name: &str,
        value: Value,
    ) -> Result<Value, WireError> {
        let name = name.to_string();
        match self
            .call(target, |object| WireRequest::SetAttribute {
                object,
                name,
                value,
            })
            .await?
        {
            WireResponse::Return { value } => Ok(value),
            other => Err(WireError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn notify_quit(&self, target: &TransportId) -> Result<(), WireError> {
        match self
            .call(target, |object| WireRequest::Quit { object })
            .await?
        {
            WireResponse::QuitAck => Ok(()),
            other => Err(WireError::UnexpectedResponse(format!("{other:?}"))),
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.value().abort();
        }
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr, WireError> {
    addr.parse().map_err(|e| {
        WireError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid peer address {addr}: {e}"),
        ))
    })
}

fn emit(events: &EventSink, event: TransportEvent) {
    if events.send(event).is_err() {
        debug!("Event sink closed, dropping transport event");
    }
}

/// One discovery session: handshake, list, then follow notifications.
///
/// However it ends, every object of the host is withdrawn.
async fn run_session(
    addr: SocketAddr,
    identity: &NodeIdentity,
    registry: &HostRegistry,
    events: &EventSink,
) -> Result<(), WireError> {
    let stream = TcpStream::connect(addr).await?;
    let (mut reader, mut writer) = stream.into_split();
    let remote = client_handshake(&mut reader, &mut writer, identity).await?;
    let node_id = remote.node_id.clone();

    // Objects remembered from an earlier session that was stopped.
    let previous = registry
        .get_host(&node_id)
        .map(|h| h.objects)
        .unwrap_or_default();
    registry.add_host(HostEntry {
        node_id: remote.node_id,
        node_name: remote.node_name,
        address: addr,
        objects: Vec::new(),
        state: HostState::Connected,
        connected_at: chrono::Utc::now(),
        protocol_version: remote.protocol_version,
    });

    let result = follow_session(
        &mut reader,
        &mut writer,
        &node_id,
        &previous,
        registry,
        events,
    )
    .await;

    for object in registry.mark_disconnected(&node_id) {
        emit(
            events,
            TransportEvent::Withdrawn {
                transport_id: transport_id_for(&node_id, &object),
            },
        );
    }
    result
}

async fn follow_session(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    node_id: &str,
    previous: &[String],
    registry: &HostRegistry,
    events: &EventSink,
) -> Result<(), WireError> {
    let objects = match request(reader, writer, WireRequest::Discover).await? {
        WireResponse::DiscoverResult { objects } => objects,
        WireResponse::Error { code, message } => return Err(WireError::Remote { code, message }),
        other => return Err(WireError::UnexpectedResponse(format!("{other:?}"))),
    };
    info!(node_id, objects = objects.len(), "Discovery session established");

    for object in previous {
        if !objects.iter().any(|o| &o.name == object) {
            emit(
                events,
                TransportEvent::Withdrawn {
                    transport_id: transport_id_for(node_id, object),
                },
            );
        }
    }
    for descriptor in objects {
        if registry.add_object(node_id, &descriptor.name) {
            let transport_id = transport_id_for(node_id, &descriptor.name);
            emit(
                events,
                TransportEvent::Announced {
                    descriptor,
                    transport_id,
                },
            );
        }
    }

    loop {
        let msg = read_message(reader).await?;
        match msg.kind {
            WireMessageKind::Notification(notification) => {
                if !apply_notification(node_id, notification, registry, events) {
                    return Ok(());
                }
            }
            other => warn!(node_id, "Unexpected message on discovery session: {other:?}"),
        }
    }
}

/// Translate a host notification into transport events. Returns false when
/// the session should end.
fn apply_notification(
    node_id: &str,
    notification: WireNotification,
    registry: &HostRegistry,
    events: &EventSink,
) -> bool {
    match notification {
        WireNotification::ObjectAnnounced { object } => {
            debug!(node_id, object = %object.name, "Object announced");
            if registry.add_object(node_id, &object.name) {
                let transport_id = transport_id_for(node_id, &object.name);
                emit(
                    events,
                    TransportEvent::Announced {
                        descriptor: object,
                        transport_id,
                    },
                );
            }
        }
        WireNotification::ObjectWithdrawn { object } => {
            debug!(node_id, %object, "Object withdrawn");
            if registry.remove_object(node_id, &object) {
                emit(
                    events,
                    TransportEvent::Withdrawn {
                        transport_id: transport_id_for(node_id, &object),
                    },
                );
            }
        }
        WireNotification::AttributeUpdated {
            object,
            name,
            value,
        } => {
            emit(
                events,
                TransportEvent::AttributeUpdated {
                    transport_id: transport_id_for(node_id, &object),
                    name,
                    value,
                },
            );
        }
        WireNotification::ShuttingDown => {
            info!(node_id, "Host is shutting down");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostConfig, HostNode, HostNotifier, ObjectHost};
    use remora_types::object::{MethodDesc, ObjectDescriptor, ValueType};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const SECRET: &str = "test-secret-for-unit-tests";

    struct CounterHost {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectHost for CounterHost {
        fn objects(&self) -> Vec<ObjectDescriptor> {
            vec![ObjectDescriptor::new("Counter", "counts calls")
                .with_method(MethodDesc::new("bump", ValueType::Int))]
        }

        async fn invoke(
            &self,
            _object: &str,
            operation: &str,
            _args: Vec<Value>,
        ) -> Result<Value, String> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(operation.to_string());
            Ok(Value::Int(calls.len() as i64))
        }

        async fn get_attribute(&self, _object: &str, name: &str) -> Result<Value, String> {
            Err(format!("no attribute {name}"))
        }

        async fn set_attribute(
            &self,
            _object: &str,
            name: &str,
            _value: Value,
        ) -> Result<Value, String> {
            Err(format!("no attribute {name}"))
        }

        async fn quit(&self, _object: &str) -> Result<(), String> {
            Ok(())
        }
    }

    async fn start_host() -> Arc<HostNode> {
        let config = HostConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            node_id: "host-1".to_string(),
            node_name: "host".to_string(),
            shared_secret: SECRET.to_string(),
        };
        let host = Arc::new(CounterHost {
            calls: Mutex::new(Vec::new()),
        });
        let (node, _task) = HostNode::start(config, host, HostNotifier::new())
            .await
            .unwrap();
        node
    }

    fn network(peers: Vec<String>) -> NetworkConfig {
        NetworkConfig {
            shared_secret: SECRET.to_string(),
            peers,
            ..Default::default()
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
    }

    #[test]
    fn test_new_requires_secret() {
        let result = TcpTransport::new(&NetworkConfig::default());
        assert!(matches!(result, Err(WireError::HandshakeFailed(_))));
    }

    #[test]
    fn test_new_rejects_bad_peer_address() {
        let result = TcpTransport::new(&network(vec!["not-an-address".into()]));
        assert!(matches!(result, Err(WireError::Io(_))));
    }

    #[tokio::test]
    async fn test_unknown_target() {
        let transport = TcpTransport::new(&network(vec![])).unwrap();
        let target = TransportId::new("host-9/Ghost");
        let result = transport.invoke(&target, "bump", vec![]).await;
        assert!(matches!(result, Err(WireError::UnknownObject(_))));
    }

    #[tokio::test]
    async fn test_discover_invoke_and_withdraw_on_shutdown() {
        let node = start_host().await;
        let transport =
            TcpTransport::new(&network(vec![node.local_addr().to_string()])).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start_discovery(tx).await.unwrap();

        let transport_id = match next_event(&mut rx).await {
            TransportEvent::Announced {
                descriptor,
                transport_id,
            } => {
                assert_eq!(descriptor.name, "Counter");
                transport_id
            }
            other => panic!("Expected Announced, got {other:?}"),
        };
        assert_eq!(transport_id.as_str(), "host-1/Counter");

        let value = transport.invoke(&transport_id, "bump", vec![]).await.unwrap();
        assert_eq!(value, Value::Int(1));

        let err = transport.get_attribute(&transport_id, "missing").await;
        assert!(matches!(
            err,
            Err(WireError::Remote { code: codes::OBJECT_FAILURE, .. })
        ));

        transport.notify_quit(&transport_id).await.unwrap();
        match next_event(&mut rx).await {
            TransportEvent::Withdrawn { transport_id: id } => assert_eq!(id, transport_id),
            other => panic!("Expected Withdrawn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_add_peer_while_discovering() {
        let node = start_host().await;
        let transport = TcpTransport::new(&network(vec![])).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start_discovery(tx).await.unwrap();

        transport.add_peer(node.local_addr()).await;
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Announced { .. }
        ));
        assert_eq!(transport.registry().connected_count(), 1);

        node.shutdown();
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Withdrawn { .. }
        ));
        assert_eq!(transport.registry().connected_count(), 0);
    }
}
