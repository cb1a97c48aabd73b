//! Proxy registry: the table of proxies bound to remote objects.
//!
//! The registry owns every [`ProxyEntry`] and all timer bookkeeping. It never
//! calls into application code; the dispatcher reads snapshots out of it and
//! fires callbacks with no lock held.

use chrono::{DateTime, Utc};
use remora_types::error::{RemoraError, RemoraResult};
use remora_types::object::{ObjectDescriptor, ProxyId, ProxyState, TransportId, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

/// Periodic timer state attached to one proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerState {
    pub interval_ms: u64,
    /// Ticks counted since the timer was last enabled.
    pub tick_count: u64,
    pub enabled: bool,
    /// Changes on every enable and disable; ticks scheduled under an older
    /// generation are stale.
    pub generation: u64,
}

/// A proxy as stored in the registry.
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub id: ProxyId,
    pub name: String,
    pub transport_id: TransportId,
    /// Introspection data, with attribute values refreshed by updates.
    pub descriptor: ObjectDescriptor,
    pub state: ProxyState,
    pub timer: Option<TimerState>,
    pub discovered_at: DateTime<Utc>,
}

impl ProxyEntry {
    /// Whether the proxy is neither dead nor purged.
    pub fn is_live(&self) -> bool {
        self.state != ProxyState::Dead
    }
}

#[derive(Debug)]
struct Inner {
    next_id: u64,
    next_generation: u64,
    /// Ordered by id, which is insertion order.
    entries: BTreeMap<ProxyId, ProxyEntry>,
    /// Live proxies only.
    by_transport: HashMap<TransportId, ProxyId>,
}

/// Thread-safe proxy table.
#[derive(Debug)]
pub struct ProxyRegistry {
    inner: RwLock<Inner>,
    max_proxies: usize,
}

impl ProxyRegistry {
    /// Create an empty registry holding at most `max_proxies` live proxies.
    pub fn new(max_proxies: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_id: 1,
                next_generation: 1,
                entries: BTreeMap::new(),
                by_transport: HashMap::new(),
            }),
            max_proxies,
        }
    }

    /// Insert a new proxy in the `Discovered` state with a fresh id.
    pub fn register(
        &self,
        descriptor: ObjectDescriptor,
        transport_id: TransportId,
    ) -> RemoraResult<ProxyEntry> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.by_transport.contains_key(&transport_id) {
            return Err(RemoraError::DuplicateRegistration(transport_id));
        }
        if inner.by_transport.len() >= self.max_proxies {
            return Err(RemoraError::RegistryFull(self.max_proxies));
        }

        let id = ProxyId(inner.next_id);
        inner.next_id += 1;
        let entry = ProxyEntry {
            id,
            name: descriptor.name.clone(),
            transport_id: transport_id.clone(),
            descriptor,
            state: ProxyState::Discovered,
            timer: None,
            discovered_at: Utc::now(),
        };
        inner.by_transport.insert(transport_id, id);
        inner.entries.insert(id, entry.clone());
        Ok(entry)
    }

    /// `Discovered → Active`.
    pub fn activate(&self, id: ProxyId) -> RemoraResult<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.entries.get_mut(&id) {
            Some(entry) if entry.state == ProxyState::Discovered => {
                entry.state = ProxyState::Active;
                Ok(())
            }
            _ => Err(RemoraError::InvalidProxy(id)),
        }
    }

    /// Snapshot of a proxy. Retired entries stay visible until purged.
    pub fn lookup_by_id(&self, id: ProxyId) -> RemoraResult<ProxyEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .get(&id)
            .cloned()
            .ok_or(RemoraError::InvalidProxy(id))
    }

    /// Snapshot of a live proxy; `InvalidProxy` for dead or unknown ids.
    pub fn live(&self, id: ProxyId) -> RemoraResult<ProxyEntry> {
        self.lookup_by_id(id)
            .ok()
            .filter(ProxyEntry::is_live)
            .ok_or(RemoraError::InvalidProxy(id))
    }

    /// First live proxy with this name, by insertion order.
    pub fn lookup_by_name(&self, name: &str) -> Option<ProxyEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .values()
            .find(|e| e.is_live() && e.name == name)
            .cloned()
    }

    /// The live proxy bound to a transport id.
    pub fn lookup_by_transport(&self, transport_id: &TransportId) -> Option<ProxyEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .by_transport
            .get(transport_id)
            .and_then(|id| inner.entries.get(id))
            .cloned()
    }

    /// Mark a proxy `Dead` and drop its timer. Returns the state it was in.
    ///
    /// The entry stays resolvable by id until [`purge`](Self::purge).
    pub fn retire(&self, id: ProxyId) -> RemoraResult<ProxyState> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .entries
            .get_mut(&id)
            .filter(|e| e.is_live())
            .ok_or(RemoraError::InvalidProxy(id))?;
        let previous = entry.state;
        entry.state = ProxyState::Dead;
        entry.timer = None;
        let transport_id = entry.transport_id.clone();
        if inner.by_transport.get(&transport_id) == Some(&id) {
            inner.by_transport.remove(&transport_id);
        }
        Ok(previous)
    }

    /// Remove a retired entry for good.
    pub fn purge(&self, id: ProxyId) -> Option<ProxyEntry> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entries.remove(&id)?;
        if inner.by_transport.get(&entry.transport_id) == Some(&id) {
            inner.by_transport.remove(&entry.transport_id);
        }
        Some(entry)
    }

    /// Snapshots of all live proxies, in id order.
    pub fn live_entries(&self) -> Vec<ProxyEntry> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .values()
            .filter(|e| e.is_live())
            .cloned()
            .collect()
    }

    /// Ids of all live proxies, in id order.
    pub fn live_ids(&self) -> Vec<ProxyId> {
        self.live_entries().into_iter().map(|e| e.id).collect()
    }

    /// Number of live proxies.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_transport.len()
    }

    /// (Re)create an enabled timer with a zeroed count. Returns its generation.
    ///
    /// The proxy must be `Active`; this is checked before the interval.
    pub fn arm_timer(&self, id: ProxyId, interval_ms: u64) -> RemoraResult<u64> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let generation = inner.next_generation;
        let entry = inner
            .entries
            .get_mut(&id)
            .filter(|e| e.state == ProxyState::Active)
            .ok_or(RemoraError::InvalidProxy(id))?;
        if interval_ms == 0 {
            return Err(RemoraError::InvalidInterval(interval_ms));
        }
        entry.timer = Some(TimerState {
            interval_ms,
            tick_count: 0,
            enabled: true,
            generation,
        });
        inner.next_generation += 1;
        Ok(generation)
    }

    /// Disable a proxy's timer. Returns the generation it now rests at, which
    /// is newer than every loop scheduled so far, or `None` when there was
    /// nothing enabled.
    pub fn disarm_timer(&self, id: ProxyId) -> Option<u64> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let generation = inner.next_generation;
        let timer = inner.entries.get_mut(&id).and_then(|e| e.timer.as_mut())?;
        if !timer.enabled {
            return None;
        }
        timer.enabled = false;
        timer.generation = generation;
        inner.next_generation += 1;
        Some(generation)
    }

    /// Whether `generation` is still the enabled timer of an active proxy.
    pub fn is_current_timer(&self, id: ProxyId, generation: u64) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(&id).is_some_and(|e| {
            e.state == ProxyState::Active
                && e.timer
                    .is_some_and(|t| t.enabled && t.generation == generation)
        })
    }

    /// Count a tick scheduled under `generation`. Returns the new count, or
    /// `None` if the tick is stale.
    pub fn record_tick(&self, id: ProxyId, generation: u64) -> Option<u64> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entries.get_mut(&id)?;
        if entry.state != ProxyState::Active {
            return None;
        }
        let timer = entry.timer.as_mut()?;
        if !timer.enabled || timer.generation != generation {
            return None;
        }
        timer.tick_count += 1;
        Some(timer.tick_count)
    }

    /// Current timer state of a proxy, if it has one.
    pub fn timer(&self, id: ProxyId) -> Option<TimerState> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(&id).and_then(|e| e.timer)
    }

    /// Refresh a cached attribute value. Returns false if the proxy does not
    /// publish that attribute.
    pub fn update_attribute(&self, id: ProxyId, name: &str, value: Value) -> RemoraResult<bool> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .entries
            .get_mut(&id)
            .filter(|e| e.is_live())
            .ok_or(RemoraError::InvalidProxy(id))?;
        match entry.descriptor.attribute_mut(name) {
            Some(attr) => {
                attr.value = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remora_types::object::AttributeDesc;

    fn desc(name: &str) -> ObjectDescriptor {
        ObjectDescriptor::new(name, "test object")
            .with_attribute(AttributeDesc::new("timeout", Value::Int(500)))
    }

    fn active(registry: &ProxyRegistry, name: &str, tid: &str) -> ProxyId {
        let entry = registry.register(desc(name), TransportId::new(tid)).unwrap();
        registry.activate(entry.id).unwrap();
        entry.id
    }

    #[test]
    fn test_ids_start_at_one_and_are_never_reused() {
        let registry = ProxyRegistry::new(10);
        let a = active(&registry, "A", "t/a");
        let b = active(&registry, "B", "t/b");
        assert_eq!(a, ProxyId(1));
        assert_eq!(b, ProxyId(2));

        registry.retire(b).unwrap();
        registry.purge(b);
        let c = active(&registry, "B", "t/b");
        assert_eq!(c, ProxyId(3));
    }

    #[test]
    fn test_duplicate_transport_rejected_while_live() {
        let registry = ProxyRegistry::new(10);
        let a = active(&registry, "A", "t/a");
        let err = registry
            .register(desc("A"), TransportId::new("t/a"))
            .unwrap_err();
        assert_eq!(err, RemoraError::DuplicateRegistration(TransportId::new("t/a")));

        // Retired but not yet purged: the transport id is free again.
        registry.retire(a).unwrap();
        assert!(registry.register(desc("A"), TransportId::new("t/a")).is_ok());
    }

    #[test]
    fn test_registry_full() {
        let registry = ProxyRegistry::new(1);
        active(&registry, "A", "t/a");
        assert_eq!(
            registry.register(desc("B"), TransportId::new("t/b")).unwrap_err(),
            RemoraError::RegistryFull(1)
        );
    }

    #[test]
    fn test_lookup_by_name_first_live_match() {
        let registry = ProxyRegistry::new(10);
        let first = active(&registry, "Dup", "t/1");
        let second = active(&registry, "Dup", "t/2");
        assert_eq!(registry.lookup_by_name("Dup").unwrap().id, first);

        registry.retire(first).unwrap();
        assert_eq!(registry.lookup_by_name("Dup").unwrap().id, second);
        assert!(registry.lookup_by_name("Nope").is_none());
    }

    #[test]
    fn test_retire_reports_previous_state_once() {
        let registry = ProxyRegistry::new(10);
        let entry = registry
            .register(desc("A"), TransportId::new("t/a"))
            .unwrap();
        assert_eq!(registry.retire(entry.id).unwrap(), ProxyState::Discovered);
        assert_eq!(
            registry.retire(entry.id).unwrap_err(),
            RemoraError::InvalidProxy(entry.id)
        );

        // Still resolvable until purged.
        assert_eq!(
            registry.lookup_by_id(entry.id).unwrap().state,
            ProxyState::Dead
        );
        assert!(registry.live(entry.id).is_err());
        registry.purge(entry.id);
        assert!(registry.lookup_by_id(entry.id).is_err());
    }

    #[test]
    fn test_arm_timer_checks_proxy_before_interval() {
        let registry = ProxyRegistry::new(10);
        assert_eq!(
            registry.arm_timer(ProxyId(42), 0).unwrap_err(),
            RemoraError::InvalidProxy(ProxyId(42))
        );

        let id = active(&registry, "A", "t/a");
        assert_eq!(
            registry.arm_timer(id, 0).unwrap_err(),
            RemoraError::InvalidInterval(0)
        );
        assert!(registry.timer(id).is_none());
    }

    #[test]
    fn test_record_tick_rejects_stale_generation() {
        let registry = ProxyRegistry::new(10);
        let id = active(&registry, "A", "t/a");
        let first = registry.arm_timer(id, 100).unwrap();
        assert_eq!(registry.record_tick(id, first), Some(1));
        assert_eq!(registry.record_tick(id, first), Some(2));

        let second = registry.arm_timer(id, 100).unwrap();
        assert!(second > first);
        assert_eq!(registry.record_tick(id, first), None);
        assert_eq!(registry.record_tick(id, second), Some(1));

        assert!(registry.is_current_timer(id, second));
        let fence = registry.disarm_timer(id).unwrap();
        assert!(fence > second);
        assert_eq!(registry.disarm_timer(id), None);
        assert!(!registry.is_current_timer(id, second));
        assert_eq!(registry.record_tick(id, second), None);
        let timer = registry.timer(id).unwrap();
        assert!(!timer.enabled);
        assert_eq!(timer.generation, fence);
    }

    #[test]
    fn test_rearm_after_disarm_counts_from_one() {
        let registry = ProxyRegistry::new(10);
        let id = active(&registry, "A", "t/a");
        let first = registry.arm_timer(id, 100).unwrap();
        registry.record_tick(id, first);
        registry.record_tick(id, first);
        let fence = registry.disarm_timer(id).unwrap();

        let second = registry.arm_timer(id, 100).unwrap();
        assert!(second > fence);
        assert_eq!(registry.record_tick(id, first), None);
        assert_eq!(registry.record_tick(id, second), Some(1));

        registry.retire(id).unwrap();
        assert!(!registry.is_current_timer(id, second));
    }

    #[test]
    fn test_update_attribute() {
        let registry = ProxyRegistry::new(10);
        let id = active(&registry, "A", "t/a");
        assert!(registry.update_attribute(id, "timeout", Value::Int(7)).unwrap());
        assert!(!registry.update_attribute(id, "missing", Value::Int(7)).unwrap());
        let entry = registry.lookup_by_id(id).unwrap();
        assert_eq!(entry.descriptor.attribute("timeout").unwrap().value, Value::Int(7));
    }
}
