//! Proxy handles: the local stand-ins for remote objects.

use crate::dispatcher::Core;
use crate::handlers::HandlerToken;
use crate::registry::TimerState;

use remora_types::error::{RemoraError, RemoraResult};
use remora_types::object::{ObjectDescriptor, ProxyId, ProxyState, TransportId, Value};
use remora_wire::transport::WireError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Attributes every proxy answers locally.
const BUILTIN_ATTRIBUTES: [&str; 2] = ["id", "name"];

/// A cheap, cloneable handle to one proxy.
///
/// The handle outlives the proxy: once the remote object is gone every
/// operation fails with [`RemoraError::InvalidProxy`] and `state()` reports
/// `Dead`.
#[derive(Clone)]
pub struct Proxy {
    id: ProxyId,
    name: String,
    transport_id: TransportId,
    core: Arc<Core>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("transport_id", &self.transport_id)
            .finish()
    }
}

impl Proxy {
    pub(crate) fn new(
        id: ProxyId,
        name: String,
        transport_id: TransportId,
        core: Arc<Core>,
    ) -> Self {
        Self {
            id,
            name,
            transport_id,
            core,
        }
    }

    pub fn id(&self) -> ProxyId {
        self.id
    }

    /// Logical name of the remote object.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transport_id(&self) -> &TransportId {
        &self.transport_id
    }

    /// Current lifecycle state; `Dead` once purged.
    pub fn state(&self) -> ProxyState {
        self.core
            .registry
            .lookup_by_id(self.id)
            .map(|entry| entry.state)
            .unwrap_or(ProxyState::Dead)
    }

    pub fn is_alive(&self) -> bool {
        self.state() != ProxyState::Dead
    }

    /// Introspection data, with attribute values as last seen.
    pub fn descriptor(&self) -> RemoraResult<ObjectDescriptor> {
        Ok(self.core.registry.live(self.id)?.descriptor)
    }

    /// Invoke a published method on the remote object.
    ///
    /// The name and arguments are checked against the published signature
    /// before anything is sent.
    pub async fn invoke(&self, operation: &str, args: Vec<Value>) -> RemoraResult<Value> {
        let descriptor = self.descriptor()?;
        let method = descriptor
            .method(operation)
            .ok_or_else(|| RemoraError::UnknownOperation {
                object: self.name.clone(),
                operation: operation.to_string(),
            })?;
        method
            .check_args(&args)
            .map_err(|reason| RemoraError::ArgumentMismatch {
                operation: operation.to_string(),
                reason,
            })?;

        debug!(proxy = %self.id, operation, args = args.len(), "Invoking remote operation");
        self.bounded(
            format!("{}.{operation}()", self.name),
            self.core.transport.invoke(&self.transport_id, operation, args),
        )
        .await
    }

    /// Read an attribute from the remote object, refreshing the cached value.
    pub async fn get_attribute(&self, name: &str) -> RemoraResult<Value> {
        let descriptor = self.descriptor()?;
        if let Some(value) = self.builtin(name) {
            return Ok(value);
        }
        if descriptor.attribute(name).is_none() {
            return Err(self.unknown_attribute(name));
        }

        let value = self
            .bounded(
                format!("{}.{name}", self.name),
                self.core.transport.get_attribute(&self.transport_id, name),
            )
            .await?;
        self.refresh(name, value.clone());
        Ok(value)
    }

    /// The last known value of an attribute, without a round trip.
    pub fn cached_attribute(&self, name: &str) -> RemoraResult<Value> {
        let descriptor = self.descriptor()?;
        if let Some(value) = self.builtin(name) {
            return Ok(value);
        }
        descriptor
            .attribute(name)
            .map(|attr| attr.value.clone())
            .ok_or_else(|| self.unknown_attribute(name))
    }

    /// Write an attribute on the remote object. Returns the value the remote
    /// stored.
    pub async fn set_attribute(&self, name: &str, value: impl Into<Value>) -> RemoraResult<Value> {
        let value = value.into();
        let descriptor = self.descriptor()?;
        if BUILTIN_ATTRIBUTES.contains(&name) {
            return Err(self.read_only(name));
        }
        let attr = descriptor
            .attribute(name)
            .ok_or_else(|| self.unknown_attribute(name))?;
        if attr.readonly {
            return Err(self.read_only(name));
        }
        if !value.matches(attr.value_type) {
            return Err(RemoraError::ArgumentMismatch {
                operation: format!("{}.{name}", self.name),
                reason: format!("expected {}, got {}", attr.value_type, value.value_type()),
            });
        }

        let stored = self
            .bounded(
                format!("{}.{name}", self.name),
                self.core
                    .transport
                    .set_attribute(&self.transport_id, name, value),
            )
            .await?;
        self.refresh(name, stored.clone());
        Ok(stored)
    }

    /// Enable (or restart) this proxy's periodic timer.
    pub fn enable_timer(&self, interval_ms: u64) -> RemoraResult<()> {
        self.core.enable_timer(self.id, interval_ms)
    }

    /// Disable this proxy's timer. Succeeds when there is nothing to disable.
    pub fn disable_timer(&self) -> RemoraResult<()> {
        self.core.disable_timer(self.id)
    }

    /// Current timer state, if a timer was ever enabled.
    pub fn timer(&self) -> Option<TimerState> {
        self.core.registry.timer(self.id)
    }

    /// Set the tick handler, replacing any previous one.
    pub fn on_tick<F>(&self, handler: F) -> RemoraResult<HandlerToken>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.core.registry.live(self.id)?;
        Ok(self.core.handlers.set_tick(self.id, handler))
    }

    /// Add a handler for attribute updates pushed by the remote object.
    pub fn on_attribute_update<F>(&self, handler: F) -> RemoraResult<HandlerToken>
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.core.registry.live(self.id)?;
        Ok(self.core.handlers.on_attribute(self.id, handler))
    }

    /// Ask the remote object to quit and retire this proxy.
    ///
    /// The proxy is retired even when the remote fails to acknowledge in
    /// time; the fault is still returned.
    pub async fn quit(&self) -> RemoraResult<()> {
        self.core.teardown(self.id).await
    }

    fn builtin(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::Int(self.id.0 as i64)),
            "name" => Some(Value::String(self.name.clone())),
            _ => None,
        }
    }

    fn refresh(&self, name: &str, value: Value) {
        if let Err(e) = self.core.registry.update_attribute(self.id, name, value) {
            debug!(proxy = %self.id, attribute = name, error = %e, "Attribute cache not refreshed");
        }
    }

    fn unknown_attribute(&self, name: &str) -> RemoraError {
        RemoraError::UnknownAttribute {
            object: self.name.clone(),
            attribute: name.to_string(),
        }
    }

    fn read_only(&self, name: &str) -> RemoraError {
        RemoraError::ReadOnlyAttribute {
            object: self.name.clone(),
            attribute: name.to_string(),
        }
    }

    async fn bounded<T>(
        &self,
        operation: String,
        call: impl Future<Output = Result<T, WireError>>,
    ) -> RemoraResult<T> {
        let waited_ms = self.core.config.invoke_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(waited_ms), call).await {
            Ok(result) => result.map_err(RemoraError::from),
            Err(_) => Err(RemoraError::Timeout {
                operation,
                waited_ms,
            }),
        }
    }
}
