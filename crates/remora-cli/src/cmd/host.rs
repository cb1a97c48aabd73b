//! `remora host`: serve the sample objects until both have quit.

use crate::samples::{SampleHost, SAMPLE1, SAMPLE2};
use crate::ui;
use anyhow::Context;
use remora_kernel::config::load_config;
use remora_wire::{HostConfig, HostNode, HostNotifier};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Time given to in-flight replies after the last object quits.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

pub fn cmd_host(
    config_path: Option<&Path>,
    listen: Option<String>,
    secret: Option<String>,
) -> anyhow::Result<()> {
    let mut config = load_config(config_path);
    if let Some(listen) = listen {
        config.network.listen_addr = listen;
    }
    if let Some(secret) = secret {
        config.network.shared_secret = secret;
    }
    let host_config = HostConfig::from_network(&config.network)?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(serve(host_config))
}

async fn serve(config: HostConfig) -> anyhow::Result<()> {
    let notifier = HostNotifier::new();
    let host = Arc::new(SampleHost::new(notifier.clone()));
    let (node, accept) = HostNode::start(config, host.clone(), notifier).await?;

    ui::section("Remora sample host");
    ui::kv("Listening", &node.local_addr().to_string());
    ui::kv("Node", node.node_id());
    ui::kv("Objects", &format!("{SAMPLE1}, {SAMPLE2}"));
    ui::hint(&format!(
        "remora demo --peer {} --secret <secret>",
        node.local_addr()
    ));
    ui::blank();

    tokio::select! {
        _ = host.all_quit() => ui::success("All sample objects quit"),
        _ = tokio::signal::ctrl_c() => ui::warn("Interrupted"),
    }

    node.shutdown();
    tokio::time::sleep(DRAIN_GRACE).await;
    let _ = accept.await;
    Ok(())
}
