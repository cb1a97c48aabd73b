//! HostNode: the remote side that exposes objects to controllers.
//!
//! A [`HostNode`] binds a TCP listener and accepts connections from
//! controllers. Every connection must open with an authenticated handshake.
//! After a `Discover` request the connection becomes a discovery session and
//! receives the notifications published through the node's [`HostNotifier`].
//!
//! The [`ObjectHost`] trait abstracts the objects themselves.

use crate::conn::{read_message, write_message, NodeIdentity};
use crate::message::*;
use crate::transport::WireError;

use async_trait::async_trait;
use remora_types::config::NetworkConfig;
use remora_types::object::{ObjectDescriptor, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

/// Capacity of the notification fan-out channel.
const NOTIFICATION_BUFFER: usize = 256;

/// Configuration for a HostNode.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address to bind the listener on.
    pub listen_addr: SocketAddr,
    /// This node's unique ID.
    pub node_id: String,
    /// This node's human-readable name.
    pub node_name: String,
    /// Pre-shared key for HMAC-SHA256 authentication. Required.
    pub shared_secret: String,
}

impl HostConfig {
    /// Build a host configuration from the `[network]` config section.
    pub fn from_network(network: &NetworkConfig) -> Result<Self, WireError> {
        let listen_addr = network.listen_addr.parse().map_err(|e| {
            WireError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid listen_addr {}: {e}", network.listen_addr),
            ))
        })?;
        Ok(Self {
            listen_addr,
            node_id: uuid::Uuid::new_v4().to_string(),
            node_name: network.node_name.clone(),
            shared_secret: network.shared_secret.clone(),
        })
    }
}

/// The objects a host exposes.
///
/// Errors are plain strings; the node reports them to the controller as
/// [`codes::OBJECT_FAILURE`].
#[async_trait]
pub trait ObjectHost: Send + Sync + 'static {
    /// Descriptors of the objects currently exposed.
    fn objects(&self) -> Vec<ObjectDescriptor>;

    /// Invoke a published method.
    async fn invoke(&self, object: &str, operation: &str, args: Vec<Value>)
        -> Result<Value, String>;

    /// Read a published attribute.
    async fn get_attribute(&self, object: &str, name: &str) -> Result<Value, String>;

    /// Write a published attribute; returns the stored value.
    async fn set_attribute(&self, object: &str, name: &str, value: Value)
        -> Result<Value, String>;

    /// Shut an object down. On success the node withdraws it.
    async fn quit(&self, object: &str) -> Result<(), String>;
}

/// Publishes notifications to every discovery session of a node.
///
/// Cheap to clone; hand one to the [`ObjectHost`] so it can push attribute
/// updates and announce or withdraw objects.
#[derive(Debug, Clone)]
pub struct HostNotifier {
    tx: broadcast::Sender<WireNotification>,
}

impl HostNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        Self { tx }
    }

    /// Announce a new object.
    pub fn announce(&self, object: ObjectDescriptor) {
        self.publish(WireNotification::ObjectAnnounced { object });
    }

    /// Withdraw an object.
    pub fn withdraw(&self, object: &str) {
        self.publish(WireNotification::ObjectWithdrawn {
            object: object.to_string(),
        });
    }

    /// Push a new attribute value.
    pub fn publish_attribute(&self, object: &str, name: &str, value: Value) {
        self.publish(WireNotification::AttributeUpdated {
            object: object.to_string(),
            name: name.to_string(),
            value,
        });
    }

    /// Number of discovery sessions currently subscribed.
    pub fn session_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, notification: WireNotification) {
        // No subscribers is fine: nobody is discovering yet.
        let _ = self.tx.send(notification);
    }

    fn subscribe(&self) -> broadcast::Receiver<WireNotification> {
        self.tx.subscribe()
    }
}

impl Default for HostNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// The local network node exposing objects.
pub struct HostNode {
    identity: NodeIdentity,
    /// Actual bound address (useful when binding to port 0).
    local_addr: SocketAddr,
    host: Arc<dyn ObjectHost>,
    notifier: HostNotifier,
    start_time: Instant,
    shutdown_tx: watch::Sender<bool>,
}

impl HostNode {
    /// Create and start listening on the configured address.
    pub async fn start(
        config: HostConfig,
        host: Arc<dyn ObjectHost>,
        notifier: HostNotifier,
    ) -> Result<(Arc<Self>, tokio::task::JoinHandle<()>), WireError> {
        if config.shared_secret.is_empty() {
            return Err(WireError::HandshakeFailed(
                "HostNode requires shared_secret. Set [network] shared_secret in config.toml"
                    .into(),
            ));
        }

        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            node_id = %config.node_id,
            objects = host.objects().len(),
            "Host node listening"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let node = Arc::new(Self {
            identity: NodeIdentity {
                node_id: config.node_id,
                node_name: config.node_name,
                shared_secret: config.shared_secret,
            },
            local_addr,
            host,
            notifier,
            start_time: Instant::now(),
            shutdown_tx,
        });

        let node_clone = Arc::clone(&node);
        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, node_clone, shutdown_rx).await;
        });

        Ok((node, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &str {
        &self.identity.node_id
    }

    /// The notifier feeding this node's discovery sessions.
    pub fn notifier(&self) -> &HostNotifier {
        &self.notifier
    }

    /// Tell every discovery session the host is going away and stop accepting.
    pub fn shutdown(&self) {
        info!(node_id = %self.identity.node_id, "Host node shutting down");
        self.notifier.publish(WireNotification::ShuttingDown);
        let _ = self.shutdown_tx.send(true);
    }

    async fn accept_loop(
        listener: TcpListener,
        node: Arc<HostNode>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(%addr, "Accepted controller connection");
                        let node = Arc::clone(&node);
                        tokio::spawn(async move {
                            if let Err(e) = node.handle_inbound(stream, addr).await {
                                debug!(%addr, error = %e, "Controller connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                },
                _ = shutdown_rx.changed() => {
                    debug!("Accept loop stopped");
                    return;
                }
            }
        }
    }

    /// Handle a single inbound connection: handshake, then the request loop.
    async fn handle_inbound(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), WireError> {
        let (mut reader, mut writer) = stream.into_split();

        let msg = read_message(&mut reader).await?;
        let controller = match &msg.kind {
            WireMessageKind::Request(WireRequest::Handshake {
                node_id,
                node_name,
                protocol_version,
                nonce,
                auth_hmac,
            }) => {
                if *protocol_version != PROTOCOL_VERSION {
                    let err = WireResponse::Error {
                        code: codes::VERSION_MISMATCH,
                        message: format!(
                            "Protocol version mismatch: expected {}, got {}",
                            PROTOCOL_VERSION, protocol_version
                        ),
                    };
                    write_message(&mut writer, &WireMessage::reply(&msg.id, err)).await?;
                    return Err(WireError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: *protocol_version,
                    });
                }

                if !self.identity.verify(nonce, node_id, auth_hmac) {
                    let err = WireResponse::Error {
                        code: codes::FORBIDDEN,
                        message: "HMAC authentication failed".to_string(),
                    };
                    write_message(&mut writer, &WireMessage::reply(&msg.id, err)).await?;
                    return Err(WireError::HandshakeFailed(
                        "HMAC verification failed on incoming Handshake".into(),
                    ));
                }

                let (ack_nonce, ack_hmac) = self.identity.sign();
                let ack = WireResponse::HandshakeAck {
                    node_id: self.identity.node_id.clone(),
                    node_name: self.identity.node_name.clone(),
                    protocol_version: PROTOCOL_VERSION,
                    nonce: ack_nonce,
                    auth_hmac: ack_hmac,
                };
                write_message(&mut writer, &WireMessage::reply(&msg.id, ack)).await?;

                debug!(controller = %node_name, node_id = %node_id, %addr, "Handshake complete");
                node_id.clone()
            }
            // Everything else must wait for an authenticated handshake.
            _ => {
                warn!(%addr, "Rejected unauthenticated message, handshake required");
                let err = WireResponse::Error {
                    code: codes::UNAUTHENTICATED,
                    message: "Authentication required: complete HMAC handshake first".to_string(),
                };
                write_message(&mut writer, &WireMessage::reply(&msg.id, err)).await?;
                return Err(WireError::HandshakeFailed(
                    "Rejected unauthenticated request, handshake required".into(),
                ));
            }
        };

        // Reads run in their own task so the select below only waits on
        // cancel-safe channel receives.
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Result<WireMessage, WireError>>(16);
        let reader_task = tokio::spawn(async move {
            loop {
                let next = read_message(&mut reader).await;
                let done = next.is_err();
                if inbound_tx.send(next).await.is_err() || done {
                    return;
                }
            }
        });

        let mut subscription: Option<broadcast::Receiver<WireNotification>> = None;
        let result = loop {
            tokio::select! {
                inbound = inbound_rx.recv() => {
                    let msg = match inbound {
                        Some(Ok(msg)) => msg,
                        Some(Err(WireError::ConnectionClosed)) | None => break Ok(()),
                        Some(Err(e)) => break Err(e),
                    };
                    let request = match msg.kind {
                        WireMessageKind::Request(request) => request,
                        other => {
                            warn!(%controller, id = %msg.id, "Unexpected non-request message: {other:?}");
                            continue;
                        }
                    };
                    if matches!(request, WireRequest::Discover) && subscription.is_none() {
                        // Subscribe before listing so no announcement falls in between.
                        subscription = Some(self.notifier.subscribe());
                        info!(%controller, "Discovery session opened");
                    }
                    let (response, withdrawn) = self.handle_request(request).await;
                    if let Err(e) = write_message(&mut writer, &WireMessage::reply(&msg.id, response)).await {
                        break Err(e);
                    }
                    if let Some(object) = withdrawn {
                        self.notifier.withdraw(&object);
                    }
                }
                notification = next_notification(&mut subscription) => {
                    let Some(notification) = notification else {
                        break Ok(());
                    };
                    let closing = matches!(notification, WireNotification::ShuttingDown);
                    let msg = WireMessage::new(WireMessageKind::Notification(notification));
                    if let Err(e) = write_message(&mut writer, &msg).await {
                        break Err(e);
                    }
                    if closing {
                        break Ok(());
                    }
                }
            }
        };

        reader_task.abort();
        result
    }

    /// Produce the response to a request. Also returns the name of an object
    /// to withdraw once the response has been sent.
    async fn handle_request(&self, request: WireRequest) -> (WireResponse, Option<String>) {
        let exposed = |object: &str| self.host.objects().iter().any(|o| o.name == object);
        let unknown = |object: &str| WireResponse::Error {
            code: codes::UNKNOWN_OBJECT,
            message: format!("Object not found: {object}"),
        };
        let failure = |message: String| WireResponse::Error {
            code: codes::OBJECT_FAILURE,
            message,
        };

        let response = match request {
            WireRequest::Ping => WireResponse::Pong {
                uptime_secs: self.start_time.elapsed().as_secs(),
            },
            WireRequest::Discover => WireResponse::DiscoverResult {
                objects: self.host.objects(),
            },
            WireRequest::Invoke {
                object,
                operation,
                args,
            } => {
                if !exposed(&object) {
                    return (unknown(&object), None);
                }
                match self.host.invoke(&object, &operation, args).await {
                    Ok(value) => WireResponse::Return { value },
                    Err(e) => failure(e),
                }
            }
            WireRequest::GetAttribute { object, name } => {
                if !exposed(&object) {
                    return (unknown(&object), None);
                }
                match self.host.get_attribute(&object, &name).await {
                    Ok(value) => WireResponse::Return { value },
                    Err(e) => failure(e),
                }
            }
            WireRequest::SetAttribute {
                object,
                name,
                value,
            } => {
                if !exposed(&object) {
                    return (unknown(&object), None);
                }
                match self.host.set_attribute(&object, &name, value).await {
                    Ok(value) => WireResponse::Return { value },
                    Err(e) => failure(e),
                }
            }
            WireRequest::Quit { object } => {
                if !exposed(&object) {
                    return (unknown(&object), None);
                }
                return match self.host.quit(&object).await {
                    Ok(()) => {
                        info!(%object, "Object quit on controller request");
                        (WireResponse::QuitAck, Some(object))
                    }
                    Err(e) => (failure(e), None),
                };
            }
            WireRequest::Handshake { .. } => WireResponse::Error {
                code: codes::BAD_REQUEST,
                message: "Already handshaked".to_string(),
            },
        };
        (response, None)
    }
}

/// Wait for the next notification on an optional subscription.
///
/// Pends forever while the connection is not a discovery session. Returns
/// `None` once the notifier is gone.
async fn next_notification(
    subscription: &mut Option<broadcast::Receiver<WireNotification>>,
) -> Option<WireNotification> {
    let Some(rx) = subscription else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(notification) => return Some(notification),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Discovery session lagged behind notifications");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{client_handshake, request};
    use remora_types::object::{AttributeDesc, MethodDesc, ValueType};
    use std::sync::Mutex;

    const SECRET: &str = "test-secret-for-unit-tests";

    /// Minimal ObjectHost exposing one echo object.
    struct EchoHost {
        alive: Mutex<bool>,
    }

    impl EchoHost {
        fn new() -> Self {
            Self {
                alive: Mutex::new(true),
            }
        }

        fn descriptor() -> ObjectDescriptor {
            ObjectDescriptor::new("Echo", "echoes its argument")
                .with_attribute(AttributeDesc::new("greeting", Value::from("hi")))
                .with_method(MethodDesc::new("echo", ValueType::String).arg("text", ValueType::String))
        }
    }

    #[async_trait]
    impl ObjectHost for EchoHost {
        fn objects(&self) -> Vec<ObjectDescriptor> {
            if *self.alive.lock().unwrap() {
                vec![Self::descriptor()]
            } else {
                vec![]
            }
        }

        async fn invoke(
            &self,
            _object: &str,
            operation: &str,
            args: Vec<Value>,
        ) -> Result<Value, String> {
            match operation {
                "echo" => Ok(args.into_iter().next().unwrap_or(Value::Void)),
                other => Err(format!("no such method {other}")),
            }
        }

        async fn get_attribute(&self, _object: &str, _name: &str) -> Result<Value, String> {
            Ok(Value::from("hi"))
        }

        async fn set_attribute(
            &self,
            _object: &str,
            _name: &str,
            value: Value,
        ) -> Result<Value, String> {
            Ok(value)
        }

        async fn quit(&self, _object: &str) -> Result<(), String> {
            *self.alive.lock().unwrap() = false;
            Ok(())
        }
    }

    fn test_config() -> HostConfig {
        HostConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            node_id: "host-1".to_string(),
            node_name: "host-node".to_string(),
            shared_secret: SECRET.to_string(),
        }
    }

    fn controller(secret: &str) -> NodeIdentity {
        NodeIdentity {
            node_id: "ctl-1".to_string(),
            node_name: "controller".to_string(),
            shared_secret: secret.to_string(),
        }
    }

    async fn start_echo() -> Arc<HostNode> {
        let (node, _task) = HostNode::start(test_config(), Arc::new(EchoHost::new()), HostNotifier::new())
            .await
            .unwrap();
        node
    }

    #[tokio::test]
    async fn test_start_requires_secret() {
        let config = HostConfig {
            shared_secret: String::new(),
            ..test_config()
        };
        let result = HostNode::start(config, Arc::new(EchoHost::new()), HostNotifier::new()).await;
        assert!(matches!(result, Err(WireError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn test_unauthenticated_discover_rejected() {
        let node = start_echo().await;
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let msg = WireMessage {
            id: "disc-1".to_string(),
            kind: WireMessageKind::Request(WireRequest::Discover),
        };
        write_message(&mut writer, &msg).await.unwrap();

        let response = read_message(&mut reader).await.unwrap();
        assert_eq!(response.id, "disc-1");
        match response.kind {
            WireMessageKind::Response(WireResponse::Error { code, message }) => {
                assert_eq!(code, codes::UNAUTHENTICATED);
                assert!(message.contains("handshake"), "got: {message}");
            }
            other => panic!("Expected Error(401), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let node = start_echo().await;
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let result = client_handshake(&mut reader, &mut writer, &controller("wrong")).await;
        match result {
            Err(WireError::HandshakeFailed(msg)) => assert!(msg.contains("403"), "got: {msg}"),
            other => panic!("Expected HandshakeFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invoke_and_unknown_object() {
        let node = start_echo().await;
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let remote = client_handshake(&mut reader, &mut writer, &controller(SECRET))
            .await
            .unwrap();
        assert_eq!(remote.node_id, "host-1");

        let response = request(
            &mut reader,
            &mut writer,
            WireRequest::Invoke {
                object: "Echo".into(),
                operation: "echo".into(),
                args: vec![Value::from("hello")],
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            response,
            WireResponse::Return { value: Value::String(ref s) } if s == "hello"
        ));

        let response = request(
            &mut reader,
            &mut writer,
            WireRequest::GetAttribute {
                object: "Nope".into(),
                name: "x".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(
            response,
            WireResponse::Error { code: codes::UNKNOWN_OBJECT, .. }
        ));
    }

    #[tokio::test]
    async fn test_discovery_session_receives_withdrawal_after_quit() {
        let node = start_echo().await;

        // Discovery session.
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut sreader, mut swriter) = stream.into_split();
        client_handshake(&mut sreader, &mut swriter, &controller(SECRET))
            .await
            .unwrap();
        match request(&mut sreader, &mut swriter, WireRequest::Discover)
            .await
            .unwrap()
        {
            WireResponse::DiscoverResult { objects } => {
                assert_eq!(objects.len(), 1);
                assert_eq!(objects[0].name, "Echo");
            }
            other => panic!("Expected DiscoverResult, got {other:?}"),
        }

        // Separate request connection asks the object to quit.
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        client_handshake(&mut reader, &mut writer, &controller(SECRET))
            .await
            .unwrap();
        let response = request(
            &mut reader,
            &mut writer,
            WireRequest::Quit {
                object: "Echo".into(),
            },
        )
        .await
        .unwrap();
        assert!(matches!(response, WireResponse::QuitAck));

        let pushed = read_message(&mut sreader).await.unwrap();
        match pushed.kind {
            WireMessageKind::Notification(WireNotification::ObjectWithdrawn { object }) => {
                assert_eq!(object, "Echo");
            }
            other => panic!("Expected ObjectWithdrawn, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shutdown_notifies_sessions() {
        let node = start_echo().await;
        let stream = TcpStream::connect(node.local_addr()).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        client_handshake(&mut reader, &mut writer, &controller(SECRET))
            .await
            .unwrap();
        request(&mut reader, &mut writer, WireRequest::Discover)
            .await
            .unwrap();

        node.shutdown();
        let pushed = read_message(&mut reader).await.unwrap();
        assert!(matches!(
            pushed.kind,
            WireMessageKind::Notification(WireNotification::ShuttingDown)
        ));
    }
}
