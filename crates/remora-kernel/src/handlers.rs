//! Application callbacks: lifecycle, tick and attribute-update handlers.
//!
//! Handlers are plain closures registered through the [`HandlerRegistry`].
//! Every registration hands back a [`HandlerToken`] that removes exactly that
//! registration. The dispatch task fires handlers from a snapshot, so a
//! handler may register or cancel other handlers without deadlocking.
//!
//! A panicking handler is caught and logged; the remaining handlers still run.

use crate::proxy::Proxy;
use dashmap::DashMap;
use remora_types::object::{ProxyId, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tracing::error;

/// Called once when a proxy becomes active.
pub type CreatedHandler = Arc<dyn Fn(&Proxy) + Send + Sync>;
/// Called once when an active proxy dies, with its name and id.
pub type DestroyedHandler = Arc<dyn Fn(&str, ProxyId) + Send + Sync>;
/// Called with the new tick count of a proxy's timer.
pub type TickHandler = Arc<dyn Fn(u64) + Send + Sync>;
/// Called with the attribute name and new value pushed by the remote.
pub type AttributeHandler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

struct Slot<H> {
    token: u64,
    handler: H,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Created,
    Destroyed,
    Tick(ProxyId),
    Attribute(ProxyId),
}

/// Cancels one handler registration.
///
/// Dropping the token keeps the handler registered.
#[derive(Debug, Clone)]
pub struct HandlerToken {
    registry: Weak<HandlerRegistry>,
    kind: HandlerKind,
    token: u64,
}

impl HandlerToken {
    /// Remove the registration this token was issued for. Returns false if it
    /// was already gone (cancelled, replaced, or its proxy died).
    pub fn cancel(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.remove(self.kind, self.token),
            None => false,
        }
    }
}

/// All registered application handlers.
pub struct HandlerRegistry {
    next_token: AtomicU64,
    created: RwLock<Vec<Slot<CreatedHandler>>>,
    destroyed: RwLock<Vec<Slot<DestroyedHandler>>>,
    /// At most one tick handler per proxy.
    ticks: DashMap<ProxyId, Slot<TickHandler>>,
    attributes: DashMap<ProxyId, Vec<Slot<AttributeHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_token: AtomicU64::new(1),
            created: RwLock::new(Vec::new()),
            destroyed: RwLock::new(Vec::new()),
            ticks: DashMap::new(),
            attributes: DashMap::new(),
        })
    }

    fn token(self: &Arc<Self>, kind: HandlerKind) -> (u64, HandlerToken) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        (
            token,
            HandlerToken {
                registry: Arc::downgrade(self),
                kind,
                token,
            },
        )
    }

    /// Add a creation handler. Handlers fire in registration order.
    pub fn on_created<F>(self: &Arc<Self>, handler: F) -> HandlerToken
    where
        F: Fn(&Proxy) + Send + Sync + 'static,
    {
        let handler: CreatedHandler = Arc::new(handler);
        let (token, handle) = self.token(HandlerKind::Created);
        self.created
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Slot { token, handler });
        handle
    }

    /// Add a destruction handler. Handlers fire in registration order.
    pub fn on_destroyed<F>(self: &Arc<Self>, handler: F) -> HandlerToken
    where
        F: Fn(&str, ProxyId) + Send + Sync + 'static,
    {
        let handler: DestroyedHandler = Arc::new(handler);
        let (token, handle) = self.token(HandlerKind::Destroyed);
        self.destroyed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Slot { token, handler });
        handle
    }

    /// Set the tick handler of a proxy, replacing any previous one.
    pub fn set_tick<F>(self: &Arc<Self>, proxy: ProxyId, handler: F) -> HandlerToken
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        let handler: TickHandler = Arc::new(handler);
        let (token, handle) = self.token(HandlerKind::Tick(proxy));
        self.ticks.insert(proxy, Slot { token, handler });
        handle
    }

    /// Add an attribute-update handler for a proxy.
    pub fn on_attribute<F>(self: &Arc<Self>, proxy: ProxyId, handler: F) -> HandlerToken
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        let handler: AttributeHandler = Arc::new(handler);
        let (token, handle) = self.token(HandlerKind::Attribute(proxy));
        self.attributes
            .entry(proxy)
            .or_default()
            .push(Slot { token, handler });
        handle
    }

    fn remove(&self, kind: HandlerKind, token: u64) -> bool {
        match kind {
            HandlerKind::Created => {
                let mut slots = self.created.write().unwrap_or_else(|e| e.into_inner());
                remove_slot(&mut slots, token)
            }
            HandlerKind::Destroyed => {
                let mut slots = self.destroyed.write().unwrap_or_else(|e| e.into_inner());
                remove_slot(&mut slots, token)
            }
            HandlerKind::Tick(proxy) => self
                .ticks
                .remove_if(&proxy, |_, slot| slot.token == token)
                .is_some(),
            HandlerKind::Attribute(proxy) => match self.attributes.get_mut(&proxy) {
                Some(mut slots) => remove_slot(&mut slots, token),
                None => false,
            },
        }
    }

    /// Forget every per-proxy handler of a dead proxy.
    pub fn clear_proxy(&self, proxy: ProxyId) {
        self.ticks.remove(&proxy);
        self.attributes.remove(&proxy);
    }

    /// Whether a tick handler is set for a proxy.
    pub fn has_tick_handler(&self, proxy: ProxyId) -> bool {
        self.ticks.contains_key(&proxy)
    }

    pub(crate) fn fire_created(&self, proxy: &Proxy) -> usize {
        let handlers: Vec<CreatedHandler> = self
            .created
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.handler.clone())
            .collect();
        for handler in &handlers {
            guarded("on_module_created", proxy.id(), || handler(proxy));
        }
        handlers.len()
    }

    pub(crate) fn fire_destroyed(&self, name: &str, proxy: ProxyId) -> usize {
        let handlers: Vec<DestroyedHandler> = self
            .destroyed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|s| s.handler.clone())
            .collect();
        for handler in &handlers {
            guarded("on_module_destroyed", proxy, || handler(name, proxy));
        }
        handlers.len()
    }

    /// Returns false when no tick handler is set.
    pub(crate) fn fire_tick(&self, proxy: ProxyId, count: u64) -> bool {
        let Some(handler) = self.ticks.get(&proxy).map(|s| s.handler.clone()) else {
            return false;
        };
        guarded("tick", proxy, || handler(count));
        true
    }

    /// Returns false when no attribute handler is registered.
    pub(crate) fn fire_attribute(&self, proxy: ProxyId, name: &str, value: &Value) -> bool {
        let handlers: Vec<AttributeHandler> = match self.attributes.get(&proxy) {
            Some(slots) => slots.iter().map(|s| s.handler.clone()).collect(),
            None => return false,
        };
        for handler in &handlers {
            guarded("attribute_update", proxy, || handler(name, value));
        }
        !handlers.is_empty()
    }
}

fn remove_slot<H>(slots: &mut Vec<Slot<H>>, token: u64) -> bool {
    let before = slots.len();
    slots.retain(|s| s.token != token);
    slots.len() != before
}

/// Run a handler, logging instead of unwinding into the dispatch task.
fn guarded(callback: &str, proxy: ProxyId, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(callback, proxy = %proxy, panic = %message, "Application handler panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[test]
    fn test_destroyed_handlers_fire_in_order() {
        let registry = HandlerRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            registry.on_destroyed(move |name, id| {
                seen.lock().unwrap().push(format!("{tag}:{name}:{id}"));
            });
        }
        assert_eq!(registry.fire_destroyed("TestSample2", ProxyId(2)), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:TestSample2:2", "second:TestSample2:2"]
        );
    }

    #[test]
    fn test_token_removes_only_its_registration() {
        let registry = HandlerRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let t1 = registry.on_destroyed(move |_, _| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = count.clone();
        registry.on_destroyed(move |_, _| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        assert!(t1.cancel());
        assert!(!t1.cancel());
        registry.fire_destroyed("x", ProxyId(1));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_replaced_tick_handler_token_is_inert() {
        let registry = HandlerRegistry::new();
        let last = Arc::new(AtomicU64::new(0));

        let old = registry.set_tick(ProxyId(1), |_| {});
        let l = last.clone();
        registry.set_tick(ProxyId(1), move |n| {
            l.store(n, Ordering::SeqCst);
        });

        assert!(!old.cancel());
        assert!(registry.fire_tick(ProxyId(1), 5));
        assert_eq!(last.load(Ordering::SeqCst), 5);
        assert!(!registry.fire_tick(ProxyId(2), 1));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let registry = HandlerRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        registry.on_destroyed(|_, _| panic!("handler bug"));
        let r = ran.clone();
        registry.on_destroyed(move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        registry.fire_destroyed("x", ProxyId(1));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_proxy_drops_per_proxy_handlers() {
        let registry = HandlerRegistry::new();
        let token = registry.set_tick(ProxyId(3), |_| {});
        registry.on_attribute(ProxyId(3), |_, _| {});
        assert!(registry.has_tick_handler(ProxyId(3)));

        registry.clear_proxy(ProxyId(3));
        assert!(!registry.has_tick_handler(ProxyId(3)));
        assert!(!registry.fire_attribute(ProxyId(3), "a", &Value::Int(1)));
        assert!(!token.cancel());
    }
}
