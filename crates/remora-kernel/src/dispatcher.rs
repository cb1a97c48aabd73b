//! The dispatcher: discovery, proxy lifecycle and the serialized callback stream.
//!
//! A [`Dispatcher`] owns the proxy registry, the timer wheel and the handler
//! registry, and runs a single dispatch task. Everything that leads to an
//! application callback funnels into that task through channels:
//!
//! - transport events (announcements, withdrawals, attribute updates)
//! - timer ticks
//! - retire and snapshot requests from `quit`
//!
//! so callbacks never run concurrently with each other, and a proxy's
//! creation callback always precedes its ticks, which precede its
//! destruction callback.

use crate::handlers::{HandlerRegistry, HandlerToken};
use crate::proxy::Proxy;
use crate::registry::{ProxyEntry, ProxyRegistry};
use crate::timer::{TimerTick, TimerWheel};

use remora_types::config::RemoraConfig;
use remora_types::error::{RemoraError, RemoraResult};
use remora_types::event::{DeliveredEvent, DeliveredKind};
use remora_types::object::{ObjectDescriptor, ProxyId, ProxyState, TransportId, Value};
use remora_wire::transport::{EventSink, Transport, TransportEvent};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests handled on the dispatch task.
pub(crate) enum Control {
    /// Retire a proxy; `done` receives whether it was still live.
    Retire {
        proxy: ProxyId,
        done: oneshot::Sender<bool>,
    },
    /// Report the live proxies once everything queued before it is handled.
    LiveProxies { done: oneshot::Sender<Vec<ProxyId>> },
}

/// State shared by the dispatcher, its dispatch task and every proxy handle.
pub(crate) struct Core {
    pub(crate) config: RemoraConfig,
    pub(crate) registry: ProxyRegistry,
    pub(crate) timers: TimerWheel,
    pub(crate) handlers: Arc<HandlerRegistry>,
    pub(crate) transport: Arc<dyn Transport>,
    runtime: Handle,
    events_tx: EventSink,
    control_tx: mpsc::UnboundedSender<Control>,
    history: RwLock<VecDeque<DeliveredEvent>>,
    discovering: AtomicBool,
    /// Serializes transport discovery start/stop.
    discovery_lock: tokio::sync::Mutex<()>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Core {
    pub(crate) fn proxy(self: &Arc<Self>, entry: &ProxyEntry) -> Proxy {
        Proxy::new(
            entry.id,
            entry.name.clone(),
            entry.transport_id.clone(),
            Arc::clone(self),
        )
    }

    pub(crate) fn enable_timer(&self, id: ProxyId, interval_ms: u64) -> RemoraResult<()> {
        let generation = self.registry.arm_timer(id, interval_ms)?;
        if self.start_tick_loop(id, interval_ms, generation) {
            info!(proxy = %id, interval_ms, "Timer enabled");
        }
        Ok(())
    }

    /// Run the tick loop for an armed generation. A disable, retire or newer
    /// enable may land between arming and scheduling; the loop is dropped
    /// (and false returned) if `generation` is no longer the proxy's timer.
    fn start_tick_loop(&self, id: ProxyId, interval_ms: u64, generation: u64) -> bool {
        self.timers.schedule(id, interval_ms, generation);
        if self.registry.is_current_timer(id, generation) {
            return true;
        }
        self.timers.cancel_before(id, generation + 1);
        debug!(proxy = %id, generation, "Timer superseded while enabling");
        false
    }

    pub(crate) fn disable_timer(&self, id: ProxyId) -> RemoraResult<()> {
        if let Some(fence) = self.registry.disarm_timer(id) {
            self.timers.cancel_before(id, fence);
            info!(proxy = %id, "Timer disabled");
        }
        Ok(())
    }

    /// Ask a live proxy's remote object to quit, then retire the proxy on the
    /// dispatch task whatever the answer was.
    pub(crate) async fn teardown(&self, id: ProxyId) -> RemoraResult<()> {
        let Ok(entry) = self.registry.live(id) else {
            debug!(proxy = %id, "Proxy already retired before quit");
            return Ok(());
        };
        self.disable_timer(id)?;

        let waited_ms = self.config.quit_timeout_ms;
        let ack = tokio::time::timeout(
            Duration::from_millis(waited_ms),
            self.transport.notify_quit(&entry.transport_id),
        )
        .await;
        let fault = match ack {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(RemoraError::from(e)),
            Err(_) => Some(RemoraError::Timeout {
                operation: format!("quit {}", entry.name),
                waited_ms,
            }),
        };
        if let Some(fault) = &fault {
            warn!(proxy = %id, name = %entry.name, error = %fault, "Quit not acknowledged, retiring anyway");
        }

        self.retire_serialized(id).await;
        fault.map_or(Ok(()), Err)
    }

    /// Live proxies as seen by the dispatch task, after every event queued
    /// ahead of the request has been handled.
    async fn live_ids_serialized(&self) -> Vec<ProxyId> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .control_tx
            .send(Control::LiveProxies { done: done_tx })
            .is_ok()
        {
            if let Ok(ids) = done_rx.await {
                return ids;
            }
        }
        self.registry.live_ids()
    }

    async fn retire_serialized(&self, id: ProxyId) {
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .control_tx
            .send(Control::Retire {
                proxy: id,
                done: done_tx,
            })
            .is_ok();
        if sent && done_rx.await.is_ok() {
            return;
        }
        // The dispatch task is gone, so nothing else is delivering callbacks.
        self.retire(id);
    }

    /// Tear a proxy down: mark it dead, cancel its timer, fire the destruction
    /// callback if it was active, then purge it. Returns false if it was
    /// already dead or unknown.
    fn retire(&self, id: ProxyId) -> bool {
        let Ok(entry) = self.registry.live(id) else {
            debug!(proxy = %id, "Proxy already retired");
            return false;
        };
        let previous = match self.registry.retire(id) {
            Ok(previous) => previous,
            Err(_) => return false,
        };
        // Dead before cancel; a racing enable sees it and drops its own loop.
        self.timers.cancel(id);

        if previous == ProxyState::Active {
            self.handlers.fire_destroyed(&entry.name, id);
            self.record(DeliveredKind::Destroyed {
                id,
                name: entry.name.clone(),
            });
        }
        self.registry.purge(id);
        self.handlers.clear_proxy(id);
        info!(proxy = %id, name = %entry.name, "Proxy destroyed");
        true
    }

    fn on_announcement(self: &Arc<Self>, descriptor: ObjectDescriptor, transport_id: TransportId) {
        if self.shutting_down.load(Ordering::SeqCst) {
            debug!(transport_id = %transport_id, "Shutting down, announcement ignored");
            return;
        }
        if descriptor.name.is_empty() {
            warn!(transport_id = %transport_id, "Announcement without an object name ignored");
            return;
        }
        if self.registry.lookup_by_transport(&transport_id).is_some() {
            debug!(transport_id = %transport_id, "Repeated announcement ignored");
            return;
        }

        let entry = match self.registry.register(descriptor, transport_id) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Could not register announced object");
                return;
            }
        };
        if let Err(e) = self.registry.activate(entry.id) {
            warn!(proxy = %entry.id, error = %e, "Could not activate proxy");
            return;
        }

        info!(
            proxy = %entry.id,
            name = %entry.name,
            transport_id = %entry.transport_id,
            "Proxy created"
        );
        let proxy = self.proxy(&entry);
        self.handlers.fire_created(&proxy);
        self.record(DeliveredKind::Created {
            id: entry.id,
            name: entry.name,
        });
    }

    fn on_withdrawal(&self, transport_id: &TransportId) {
        match self.registry.lookup_by_transport(transport_id) {
            Some(entry) => {
                debug!(proxy = %entry.id, transport_id = %transport_id, "Remote object withdrawn");
                self.retire(entry.id);
            }
            None => debug!(transport_id = %transport_id, "Withdrawal for unknown object ignored"),
        }
    }

    fn on_attribute_update(&self, transport_id: &TransportId, name: &str, value: Value) {
        let Some(entry) = self.registry.lookup_by_transport(transport_id) else {
            debug!(transport_id = %transport_id, attribute = name, "Update for unknown object ignored");
            return;
        };
        match self.registry.update_attribute(entry.id, name, value.clone()) {
            Ok(true) => {}
            Ok(false) => {
                debug!(proxy = %entry.id, attribute = name, "Update for unpublished attribute")
            }
            Err(_) => return,
        }
        self.handlers.fire_attribute(entry.id, name, &value);
        self.record(DeliveredKind::AttributeUpdated {
            id: entry.id,
            attribute: name.to_string(),
        });
    }

    fn on_tick(&self, tick: TimerTick) {
        let Some(count) = self.registry.record_tick(tick.proxy, tick.generation) else {
            debug!(proxy = %tick.proxy, generation = tick.generation, "Stale tick dropped");
            return;
        };
        let handled = self.handlers.fire_tick(tick.proxy, count);
        self.record(DeliveredKind::Tick {
            id: tick.proxy,
            count,
            handled,
        });
    }

    fn record(&self, kind: DeliveredKind) {
        let capacity = self.config.history_size;
        if capacity == 0 {
            return;
        }
        let mut history = self.history.write().unwrap_or_else(|e| e.into_inner());
        if history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(DeliveredEvent::now(kind));
    }
}

/// The single dispatch task.
async fn dispatch_loop(
    core: Arc<Core>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut ticks: mpsc::UnboundedReceiver<TimerTick>,
    mut control: mpsc::UnboundedReceiver<Control>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Dispatch task started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(request) = control.recv() => match request {
                Control::Retire { proxy, done } => {
                    let retired = core.retire(proxy);
                    let _ = done.send(retired);
                }
                Control::LiveProxies { done } => {
                    let _ = done.send(core.registry.live_ids());
                }
            },
            Some(event) = events.recv() => match event {
                TransportEvent::Announced { descriptor, transport_id } => {
                    core.on_announcement(descriptor, transport_id);
                }
                TransportEvent::Withdrawn { transport_id } => core.on_withdrawal(&transport_id),
                TransportEvent::AttributeUpdated { transport_id, name, value } => {
                    core.on_attribute_update(&transport_id, &name, value);
                }
            },
            Some(tick) = ticks.recv() => core.on_tick(tick),
            else => break,
        }
    }
    debug!("Dispatch task stopped");
}

/// Discovers remote objects and manages the proxies bound to them.
///
/// Must be started inside a tokio runtime; the synchronous operations
/// (`discover`, `enable_timer`, `disable_timer`) spawn onto that runtime and
/// may be called from any thread.
pub struct Dispatcher {
    core: Arc<Core>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Validate the configuration, capture the current runtime and start the
    /// dispatch task.
    pub fn start(config: RemoraConfig, transport: Arc<dyn Transport>) -> RemoraResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            RemoraError::Config(format!("Dispatcher must start inside a tokio runtime: {e}"))
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            max_proxies = config.max_proxies,
            quit_timeout_ms = config.quit_timeout_ms,
            invoke_timeout_ms = config.invoke_timeout_ms,
            "Dispatcher started"
        );

        let core = Arc::new(Core {
            registry: ProxyRegistry::new(config.max_proxies),
            timers: TimerWheel::new(runtime.clone(), tick_tx),
            handlers: HandlerRegistry::new(),
            history: RwLock::new(VecDeque::with_capacity(config.history_size.min(1024))),
            config,
            transport,
            runtime: runtime.clone(),
            events_tx,
            control_tx,
            discovering: AtomicBool::new(false),
            discovery_lock: tokio::sync::Mutex::new(()),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
        });

        let task = runtime.spawn(dispatch_loop(
            Arc::clone(&core),
            events_rx,
            tick_rx,
            control_rx,
            shutdown_rx,
        ));

        Ok(Self {
            core,
            dispatch_task: Mutex::new(Some(task)),
        })
    }

    /// The configuration the dispatcher runs with.
    pub fn config(&self) -> &RemoraConfig {
        &self.core.config
    }

    /// Ask the transport to start discovering. Returns immediately; a no-op
    /// while discovery is already running.
    pub fn discover(&self) -> RemoraResult<()> {
        if self.core.shutting_down.load(Ordering::SeqCst) {
            return Err(RemoraError::ShuttingDown);
        }
        if self.core.discovering.swap(true, Ordering::SeqCst) {
            debug!("Discovery already running");
            return Ok(());
        }

        let core = Arc::clone(&self.core);
        self.core.runtime.spawn(async move {
            let _guard = core.discovery_lock.lock().await;
            if !core.discovering.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = core.transport.start_discovery(core.events_tx.clone()).await {
                warn!(error = %e, "Transport failed to start discovery");
                core.discovering.store(false, Ordering::SeqCst);
            }
        });
        info!("Discovery requested");
        Ok(())
    }

    /// Stop looking for new objects. Live proxies stay.
    pub async fn stop_discovery(&self) {
        let _guard = self.core.discovery_lock.lock().await;
        if self.core.discovering.swap(false, Ordering::SeqCst) {
            self.core.transport.stop_discovery().await;
            info!("Discovery stopped");
        }
    }

    /// Whether discovery is running.
    pub fn is_discovering(&self) -> bool {
        self.core.discovering.load(Ordering::SeqCst)
    }

    /// Shut every live proxy down and end the dispatcher.
    ///
    /// Each proxy is asked to quit concurrently and given `quit_timeout_ms` to
    /// acknowledge; it is retired either way. Returns the proxies whose quit
    /// failed or timed out. Calling `quit` again returns no faults.
    pub async fn quit(&self) -> Vec<(ProxyId, RemoraError)> {
        if self.core.shutting_down.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        self.stop_discovery().await;

        // Taken on the dispatch task: an announcement already past its
        // shutdown check finishes registering before this runs.
        let ids = self.core.live_ids_serialized().await;
        info!(proxies = ids.len(), "Quitting");
        let teardowns = ids.into_iter().map(|id| {
            let core = Arc::clone(&self.core);
            async move { (id, core.teardown(id).await) }
        });
        let faults: Vec<(ProxyId, RemoraError)> = futures::future::join_all(teardowns)
            .await
            .into_iter()
            .filter_map(|(id, result)| result.err().map(|e| (id, e)))
            .collect();

        let _ = self.core.shutdown_tx.send(true);
        let task = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.core.timers.cancel_all();

        info!(faults = faults.len(), "Dispatcher stopped");
        faults
    }

    /// Whether `quit` has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.core.shutting_down.load(Ordering::SeqCst)
    }

    /// Enable (or restart) a proxy's periodic timer.
    pub fn enable_timer(&self, id: ProxyId, interval_ms: u64) -> RemoraResult<()> {
        self.core.enable_timer(id, interval_ms)
    }

    /// Disable a proxy's timer. Succeeds when there is nothing to disable.
    pub fn disable_timer(&self, id: ProxyId) -> RemoraResult<()> {
        self.core.disable_timer(id)
    }

    /// Number of running timer loops.
    pub fn active_timers(&self) -> usize {
        self.core.timers.active_count()
    }

    /// The live proxy with this id.
    pub fn lookup_by_id(&self, id: ProxyId) -> RemoraResult<Proxy> {
        let entry = self.core.registry.live(id)?;
        Ok(self.core.proxy(&entry))
    }

    /// The first live proxy with this name, by discovery order.
    pub fn lookup_by_name(&self, name: &str) -> Option<Proxy> {
        self.core
            .registry
            .lookup_by_name(name)
            .map(|entry| self.core.proxy(&entry))
    }

    /// All live proxies, by discovery order.
    pub fn proxies(&self) -> Vec<Proxy> {
        self.core
            .registry
            .live_entries()
            .iter()
            .map(|entry| self.core.proxy(entry))
            .collect()
    }

    /// Register a creation callback.
    pub fn on_module_created<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(&Proxy) + Send + Sync + 'static,
    {
        self.core.handlers.on_created(handler)
    }

    /// Register a destruction callback, called with the proxy's name and id.
    pub fn on_module_destroyed<F>(&self, handler: F) -> HandlerToken
    where
        F: Fn(&str, ProxyId) + Send + Sync + 'static,
    {
        self.core.handlers.on_destroyed(handler)
    }

    /// Set the tick handler of a live proxy, replacing any previous one.
    pub fn set_tick_handler<F>(&self, id: ProxyId, handler: F) -> RemoraResult<HandlerToken>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        self.core.registry.live(id)?;
        Ok(self.core.handlers.set_tick(id, handler))
    }

    /// Recent deliveries on the callback stream, most recent first.
    pub fn history(&self, limit: usize) -> Vec<DeliveredEvent> {
        let history = self.core.history.read().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let _ = self.core.shutdown_tx.send(true);
        self.core.timers.cancel_all();
    }
}
