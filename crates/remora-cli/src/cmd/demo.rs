//! `remora demo`: a controller for the sample host.
//!
//! Discovers `TestSample1` and `TestSample2`, starts a timer on `TestSample2`
//! once both exist, reports every tenth tick through
//! `TestSample1.printThisText`, and quits everything at the stop tick.

use crate::samples::{SAMPLE1, SAMPLE2};
use crate::ui;
use anyhow::{bail, Context};
use remora_kernel::config::load_config;
use remora_kernel::{Dispatcher, Proxy};
use remora_types::config::RemoraConfig;
use remora_types::error::RemoraResult;
use remora_types::object::{ProxyId, Value};
use remora_wire::TcpTransport;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub struct DemoOptions {
    pub peers: Vec<String>,
    pub secret: Option<String>,
    pub period: u64,
    pub stop_at: u64,
    pub remote_timer: bool,
}

/// Callbacks forward here so the controller can await remote calls.
enum DemoEvent {
    Created(Proxy),
    Destroyed(String, ProxyId),
    Tick(u64),
}

pub fn cmd_demo(config_path: Option<&Path>, options: DemoOptions) -> anyhow::Result<()> {
    let mut config = load_config(config_path);
    config.network.peers.extend(options.peers.iter().cloned());
    if let Some(secret) = &options.secret {
        config.network.shared_secret = secret.clone();
    }
    if config.network.peers.is_empty() {
        bail!("No hosts to discover. Pass --peer <addr> or set [network] peers in config.toml");
    }
    if options.stop_at == 0 {
        bail!("--stop-at must be at least 1");
    }

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(run(config, options))
}

async fn run(config: RemoraConfig, options: DemoOptions) -> anyhow::Result<()> {
    let transport = Arc::new(TcpTransport::new(&config.network)?);
    let dispatcher = Dispatcher::start(config, transport)?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let created = tx.clone();
    dispatcher.on_module_created(move |proxy| {
        let _ = created.send(DemoEvent::Created(proxy.clone()));
    });
    let destroyed = tx.clone();
    dispatcher.on_module_destroyed(move |name, id| {
        let _ = destroyed.send(DemoEvent::Destroyed(name.to_string(), id));
    });

    ui::section("Discovering sample objects");
    ui::hint("Ctrl+C to quit early");
    dispatcher.discover()?;

    let mut demo = Demo {
        options,
        ticks: tx,
        sample1: None,
        sample2: None,
        running: false,
    };
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                ui::warn("Interrupted");
                break;
            }
        };
        let Some(event) = event else { break };
        if !demo.handle(event).await {
            break;
        }
    }

    ui::blank();
    ui::section("Quitting");
    let faults = dispatcher.quit().await;
    for (id, fault) in &faults {
        ui::warn(&format!("proxy {id}: {fault}"));
    }
    ui::kv("Deliveries", &dispatcher.history(usize::MAX).len().to_string());
    ui::success("Demo finished");
    Ok(())
}

struct Demo {
    options: DemoOptions,
    ticks: mpsc::UnboundedSender<DemoEvent>,
    sample1: Option<Proxy>,
    sample2: Option<Proxy>,
    running: bool,
}

impl Demo {
    /// Returns false once the demo is done.
    async fn handle(&mut self, event: DemoEvent) -> bool {
        match event {
            DemoEvent::Created(proxy) => {
                let name = proxy.name().to_string();
                println!("got new object {name}");
                match name.as_str() {
                    SAMPLE1 => self.sample1 = Some(proxy),
                    SAMPLE2 => self.sample2 = Some(proxy),
                    other => debug!(name = other, "Ignoring unrelated object"),
                }
                self.start_timer().await;
            }
            DemoEvent::Destroyed(name, id) => {
                println!("dead object {name}");
                if self.sample1.as_ref().is_some_and(|p| p.id() == id) {
                    self.sample1 = None;
                    self.stop_timer().await;
                } else if self.sample2.as_ref().is_some_and(|p| p.id() == id) {
                    self.sample2 = None;
                    self.running = false;
                }
            }
            DemoEvent::Tick(count) => {
                if count % 10 == 0 {
                    println!("tick reached {count}");
                    self.print(&format!("tick reached {count}")).await;
                }
                if count >= self.options.stop_at {
                    let message = format!("disable timer at {} on {SAMPLE2}", self.options.stop_at);
                    println!("{message}");
                    self.print(&message).await;
                    self.stop_timer().await;
                    return false;
                }
            }
        }
        true
    }

    async fn start_timer(&mut self) {
        if self.running || self.sample1.is_none() {
            return;
        }
        let Some(sample2) = self.sample2.clone() else {
            return;
        };

        let ticks = self.ticks.clone();
        let result: RemoraResult<()> = if self.options.remote_timer {
            let followed = sample2.on_attribute_update(move |name, value| {
                if name != "timerTriggerNo" {
                    return;
                }
                if let Some(count) = value.as_int().filter(|n| *n > 0) {
                    let _ = ticks.send(DemoEvent::Tick(count as u64));
                }
            });
            match followed {
                Ok(_) => sample2
                    .invoke("enableTimer", vec![Value::Int(self.options.period as i64)])
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            }
        } else {
            sample2
                .on_tick(move |count| {
                    let _ = ticks.send(DemoEvent::Tick(count));
                })
                .and_then(|_| sample2.enable_timer(self.options.period))
        };

        match result {
            Ok(()) => {
                self.running = true;
                println!("enable timer on {SAMPLE2}");
                self.print(&format!("enable timer on {SAMPLE2}")).await;
            }
            Err(e) => ui::error(&format!("Could not enable timer on {SAMPLE2}: {e}")),
        }
    }

    async fn stop_timer(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        let Some(sample2) = &self.sample2 else {
            return;
        };
        let result = if self.options.remote_timer {
            sample2.invoke("disableTimer", Vec::new()).await.map(|_| ())
        } else {
            sample2.disable_timer()
        };
        if let Err(e) = result {
            ui::warn(&format!("Could not disable timer on {SAMPLE2}: {e}"));
        }
    }

    async fn print(&self, text: &str) {
        let Some(sample1) = &self.sample1 else {
            return;
        };
        if let Err(e) = sample1.invoke("printThisText", vec![Value::from(text)]).await {
            ui::warn(&format!("printThisText failed: {e}"));
        }
    }
}
