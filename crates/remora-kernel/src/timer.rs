//! Timer wheel: one periodic tick task per proxy.
//!
//! Each enabled timer is a spawned loop that sends [`TimerTick`]s into the
//! dispatch task. Ticks carry the generation they were scheduled under; the
//! dispatcher drops any tick whose generation no longer matches the proxy's
//! timer, so a tick already in flight when a timer is disabled or re-armed is
//! never delivered.
//!
//! The wheel keeps the generation next to each loop and never lets an older
//! generation replace a newer one, so racing enables settle on the newest.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use remora_types::object::ProxyId;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// One fired period of a proxy's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub proxy: ProxyId,
    pub generation: u64,
}

/// A running tick loop and the generation it was scheduled under.
struct TickLoop {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Owns the running tick loops, keyed by proxy.
pub struct TimerWheel {
    tasks: DashMap<ProxyId, TickLoop>,
    runtime: Handle,
    ticks: mpsc::UnboundedSender<TimerTick>,
}

impl TimerWheel {
    /// Create a wheel that spawns on `runtime` and reports on `ticks`.
    pub fn new(runtime: Handle, ticks: mpsc::UnboundedSender<TimerTick>) -> Self {
        Self {
            tasks: DashMap::new(),
            runtime,
            ticks,
        }
    }

    /// Start (or restart) the tick loop for a proxy. The first tick fires one
    /// full interval from now; missed ticks are skipped, not burst.
    ///
    /// Returns false, and starts nothing, when a loop of a newer generation is
    /// already running.
    pub fn schedule(&self, proxy: ProxyId, interval_ms: u64, generation: u64) -> bool {
        match self.tasks.entry(proxy) {
            Entry::Occupied(mut running) => {
                if running.get().generation > generation {
                    debug!(proxy = %proxy, generation, "Older timer schedule refused");
                    return false;
                }
                let replaced = running.insert(self.spawn(proxy, interval_ms, generation));
                replaced.handle.abort();
            }
            Entry::Vacant(slot) => {
                slot.insert(self.spawn(proxy, interval_ms, generation));
            }
        }
        debug!(proxy = %proxy, interval_ms, generation, "Timer scheduled");
        true
    }

    fn spawn(&self, proxy: ProxyId, interval_ms: u64, generation: u64) -> TickLoop {
        let period = Duration::from_millis(interval_ms);
        let ticks = self.ticks.clone();
        let handle = self.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if ticks.send(TimerTick { proxy, generation }).is_err() {
                    debug!(proxy = %proxy, "Dispatcher gone, timer loop exiting");
                    break;
                }
            }
        });
        TickLoop { generation, handle }
    }

    /// Stop the tick loop for a proxy. Returns false if none was running.
    pub fn cancel(&self, proxy: ProxyId) -> bool {
        if let Some((_, running)) = self.tasks.remove(&proxy) {
            running.handle.abort();
            debug!(proxy = %proxy, "Timer cancelled");
            true
        } else {
            false
        }
    }

    /// Stop the proxy's loop only if it was scheduled before `generation`.
    /// A loop started by a later enable keeps running.
    pub fn cancel_before(&self, proxy: ProxyId, generation: u64) -> bool {
        match self
            .tasks
            .remove_if(&proxy, |_, running| running.generation < generation)
        {
            Some((_, running)) => {
                running.handle.abort();
                debug!(proxy = %proxy, generation = running.generation, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Stop every tick loop.
    pub fn cancel_all(&self) {
        let proxies: Vec<ProxyId> = self.tasks.iter().map(|e| *e.key()).collect();
        for proxy in proxies {
            self.cancel(proxy);
        }
    }

    /// Number of running tick loops.
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        for entry in self.tasks.iter() {
            entry.value().handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wheel() -> (TimerWheel, mpsc::UnboundedReceiver<TimerTick>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TimerWheel::new(Handle::current(), tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_after_one_interval() {
        let (wheel, mut rx) = wheel();
        let start = Instant::now();
        wheel.schedule(ProxyId(1), 1000, 7);

        let tick = rx.recv().await.unwrap();
        assert_eq!(
            tick,
            TimerTick {
                proxy: ProxyId(1),
                generation: 7
            }
        );
        assert!(start.elapsed() >= Duration::from_millis(1000));

        rx.recv().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(2000));
        assert_eq!(wheel.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let (wheel, mut rx) = wheel();
        wheel.schedule(ProxyId(1), 100, 1);
        rx.recv().await.unwrap();

        assert!(wheel.cancel(ProxyId(1)));
        assert!(!wheel.cancel(ProxyId(1)));
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(wheel.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_loop() {
        let (wheel, mut rx) = wheel();
        wheel.schedule(ProxyId(1), 100, 1);
        wheel.schedule(ProxyId(1), 100, 2);
        assert_eq!(wheel.active_count(), 1);

        let tick = rx.recv().await.unwrap();
        assert_eq!(tick.generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_generation_never_replaces_newer() {
        let (wheel, mut rx) = wheel();
        assert!(wheel.schedule(ProxyId(1), 10, 2));
        assert!(!wheel.schedule(ProxyId(1), 10, 1));
        assert_eq!(wheel.active_count(), 1);

        for _ in 0..3 {
            assert_eq!(rx.recv().await.unwrap().generation, 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_spares_newer_loop() {
        let (wheel, mut rx) = wheel();
        wheel.schedule(ProxyId(1), 100, 5);

        assert!(!wheel.cancel_before(ProxyId(1), 5));
        assert_eq!(wheel.active_count(), 1);
        assert_eq!(rx.recv().await.unwrap().generation, 5);

        assert!(wheel.cancel_before(ProxyId(1), 6));
        assert_eq!(wheel.active_count(), 0);
        assert!(!wheel.cancel_before(ProxyId(2), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (wheel, _rx) = wheel();
        wheel.schedule(ProxyId(1), 100, 1);
        wheel.schedule(ProxyId(2), 100, 2);
        assert_eq!(wheel.active_count(), 2);
        wheel.cancel_all();
        assert_eq!(wheel.active_count(), 0);
    }
}
