//! In-process transport with scriptable objects.
//!
//! [`MemoryTransport`] behaves like a network full of remote objects without
//! any sockets: tests add and withdraw objects, push attribute updates, pick
//! how each object answers a quit request, and inspect every call that
//! reached the transport.

use crate::message::codes;
use crate::transport::{EventSink, Transport, TransportEvent, WireError};

use async_trait::async_trait;
use remora_types::object::{ObjectDescriptor, TransportId, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// How an object answers a quit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuitBehavior {
    /// Acknowledge, then withdraw the object.
    #[default]
    Ack,
    /// Refuse with a remote error; the object stays.
    Fail,
    /// Never answer.
    NeverAck,
}

/// A call that reached the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Invoke {
        target: TransportId,
        operation: String,
        args: Vec<Value>,
    },
    GetAttribute {
        target: TransportId,
        name: String,
    },
    SetAttribute {
        target: TransportId,
        name: String,
        value: Value,
    },
    Quit {
        target: TransportId,
    },
}

struct MemoryObject {
    transport_id: TransportId,
    descriptor: ObjectDescriptor,
    quit: QuitBehavior,
}

/// In-process [`Transport`].
#[derive(Default)]
pub struct MemoryTransport {
    /// In announcement order.
    objects: Mutex<Vec<MemoryObject>>,
    next_object: AtomicU64,
    /// Present while discovering.
    sink: Mutex<Option<EventSink>>,
    discovery_starts: AtomicUsize,
    invoke_results: Mutex<HashMap<String, Result<Value, String>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose a new object. Announced immediately while discovering.
    pub fn add_object(&self, descriptor: ObjectDescriptor) -> TransportId {
        let n = self.next_object.fetch_add(1, Ordering::Relaxed) + 1;
        let transport_id = TransportId(format!("mem-{n}/{}", descriptor.name));
        {
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            objects.push(MemoryObject {
                transport_id: transport_id.clone(),
                descriptor: descriptor.clone(),
                quit: QuitBehavior::Ack,
            });
        }
        self.emit(TransportEvent::Announced {
            descriptor,
            transport_id: transport_id.clone(),
        });
        transport_id
    }

    /// Remove an object as if it vanished from the network. Returns false if
    /// it was not present.
    pub fn withdraw(&self, transport_id: &TransportId) -> bool {
        let removed = {
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            let before = objects.len();
            objects.retain(|o| &o.transport_id != transport_id);
            objects.len() != before
        };
        if removed {
            self.emit(TransportEvent::Withdrawn {
                transport_id: transport_id.clone(),
            });
        }
        removed
    }

    /// Store a new attribute value and push it as an update.
    pub fn push_attribute(&self, transport_id: &TransportId, name: &str, value: Value) {
        {
            let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(attr) = objects
                .iter_mut()
                .find(|o| &o.transport_id == transport_id)
                .and_then(|o| o.descriptor.attribute_mut(name))
            {
                attr.value = value.clone();
            }
        }
        self.emit(TransportEvent::AttributeUpdated {
            transport_id: transport_id.clone(),
            name: name.to_string(),
            value,
        });
    }

    /// Choose how an object answers quit requests.
    pub fn set_quit_behavior(&self, transport_id: &TransportId, behavior: QuitBehavior) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(object) = objects.iter_mut().find(|o| &o.transport_id == transport_id) {
            object.quit = behavior;
        }
    }

    /// Script the outcome of an operation for every object. Unscripted
    /// operations return `Value::Void`.
    pub fn set_invoke_result(&self, operation: &str, result: Result<Value, String>) {
        let mut results = self.invoke_results.lock().unwrap_or_else(|e| e.into_inner());
        results.insert(operation.to_string(), result);
    }

    /// Every call that reached the transport, oldest first.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The invocations of `operation`, as argument lists.
    pub fn invocations(&self, operation: &str) -> Vec<Vec<Value>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Invoke {
                    operation: op,
                    args,
                    ..
                } if op == operation => Some(args),
                _ => None,
            })
            .collect()
    }

    /// How many times discovery was started.
    pub fn discovery_starts(&self) -> usize {
        self.discovery_starts.load(Ordering::SeqCst)
    }

    /// Whether discovery is running.
    pub fn is_discovering(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn emit(&self, event: TransportEvent) {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = sink.as_ref() {
            if sink.send(event).is_err() {
                debug!("Event sink closed, dropping transport event");
            }
        }
    }

    fn record(&self, call: RecordedCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn descriptor(&self, target: &TransportId) -> Result<ObjectDescriptor, WireError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .iter()
            .find(|o| &o.transport_id == target)
            .map(|o| o.descriptor.clone())
            .ok_or_else(|| WireError::UnknownObject(target.clone()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start_discovery(&self, events: EventSink) -> Result<(), WireError> {
        self.discovery_starts.fetch_add(1, Ordering::SeqCst);
        let announcements: Vec<TransportEvent> = {
            let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            objects
                .iter()
                .map(|o| TransportEvent::Announced {
                    descriptor: o.descriptor.clone(),
                    transport_id: o.transport_id.clone(),
                })
                .collect()
        };
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(events);
        for event in announcements {
            self.emit(event);
        }
        Ok(())
    }

    async fn stop_discovery(&self) {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    async fn invoke(
        &self,
        target: &TransportId,
        operation: &str,
        args: Vec<Value>,
    ) -> Result<Value, WireError> {
        self.record(RecordedCall::Invoke {
            target: target.clone(),
            operation: operation.to_string(),
            args,
        });
        self.descriptor(target)?;
        let scripted = self
            .invoke_results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(operation)
            .cloned();
        match scripted {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(WireError::Remote {
                code: codes::OBJECT_FAILURE,
                message,
            }),
            None => Ok(Value::Void),
        }
    }

    async fn get_attribute(&self, target: &TransportId, name: &str) -> Result<Value, WireError> {
        self.record(RecordedCall::GetAttribute {
            target: target.clone(),
            name: name.to_string(),
        });
        self.descriptor(target)?
            .attribute(name)
            .map(|a| a.value.clone())
            .ok_or_else(|| WireError::Remote {
                code: codes::OBJECT_FAILURE,
                message: format!("no attribute {name}"),
            })
    }

    async fn set_attribute(
        &self,
        target: &TransportId,
        name: &str,
        value: Value,
    ) -> Result<Value, WireError> {
        self.record(RecordedCall::SetAttribute {
            target: target.clone(),
            name: name.to_string(),
            value: value.clone(),
        });
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let object = objects
            .iter_mut()
            .find(|o| &o.transport_id == target)
            .ok_or_else(|| WireError::UnknownObject(target.clone()))?;
        let attr = object
            .descriptor
            .attribute_mut(name)
            .ok_or_else(|| WireError::Remote {
                code: codes::OBJECT_FAILURE,
                message: format!("no attribute {name}"),
            })?;
        attr.value = value.clone();
        Ok(value)
    }

    async fn notify_quit(&self, target: &TransportId) -> Result<(), WireError> {
        self.record(RecordedCall::Quit {
            target: target.clone(),
        });
        let behavior = {
            let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
            objects
                .iter()
                .find(|o| &o.transport_id == target)
                .map(|o| o.quit)
                .ok_or_else(|| WireError::UnknownObject(target.clone()))?
        };
        match behavior {
            QuitBehavior::Ack => {
                self.withdraw(target);
                Ok(())
            }
            QuitBehavior::Fail => Err(WireError::Remote {
                code: codes::OBJECT_FAILURE,
                message: "quit refused".to_string(),
            }),
            QuitBehavior::NeverAck => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_types::object::AttributeDesc;
    use tokio::sync::mpsc;

    fn sample(name: &str) -> ObjectDescriptor {
        ObjectDescriptor::new(name, "sample")
            .with_attribute(AttributeDesc::new("timeout", Value::Int(500)))
    }

    #[tokio::test]
    async fn test_start_discovery_announces_existing_objects() {
        let transport = MemoryTransport::new();
        let a = transport.add_object(sample("A"));
        let b = transport.add_object(sample("B"));
        assert_ne!(a, b);

        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start_discovery(tx).await.unwrap();
        assert!(transport.is_discovering());
        assert_eq!(transport.discovery_starts(), 1);

        match rx.recv().await.unwrap() {
            TransportEvent::Announced { transport_id, .. } => assert_eq!(transport_id, a),
            other => panic!("Expected Announced, got {other:?}"),
        }
        match rx.recv().await.unwrap() {
            TransportEvent::Announced { transport_id, .. } => assert_eq!(transport_id, b),
            other => panic!("Expected Announced, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_events_when_not_discovering() {
        let transport = MemoryTransport::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.start_discovery(tx).await.unwrap();
        transport.stop_discovery().await;

        transport.add_object(sample("Late"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_quit_behaviors() {
        let transport = MemoryTransport::new();
        let ack = transport.add_object(sample("Ack"));
        let fail = transport.add_object(sample("Fail"));
        transport.set_quit_behavior(&fail, QuitBehavior::Fail);

        transport.notify_quit(&ack).await.unwrap();
        assert!(matches!(
            transport.notify_quit(&ack).await,
            Err(WireError::UnknownObject(_))
        ));
        assert!(matches!(
            transport.notify_quit(&fail).await,
            Err(WireError::Remote { .. })
        ));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_never_ack_pends() {
        let transport = MemoryTransport::new();
        let id = transport.add_object(sample("Stuck"));
        transport.set_quit_behavior(&id, QuitBehavior::NeverAck);
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            transport.notify_quit(&id),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_scripted_invoke_and_attributes() {
        let transport = MemoryTransport::new();
        let id = transport.add_object(sample("Obj"));
        transport.set_invoke_result("answer", Ok(Value::Int(42)));
        transport.set_invoke_result("broken", Err("boom".into()));

        assert_eq!(
            transport.invoke(&id, "answer", vec![]).await.unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            transport.invoke(&id, "other", vec![]).await.unwrap(),
            Value::Void
        );
        assert!(transport.invoke(&id, "broken", vec![]).await.is_err());
        assert_eq!(transport.invocations("answer").len(), 1);

        transport
            .set_attribute(&id, "timeout", Value::Int(10))
            .await
            .unwrap();
        assert_eq!(
            transport.get_attribute(&id, "timeout").await.unwrap(),
            Value::Int(10)
        );
        transport.push_attribute(&id, "timeout", Value::Int(20));
        assert_eq!(
            transport.get_attribute(&id, "timeout").await.unwrap(),
            Value::Int(20)
        );
    }
}
