//! `remora config`: show the configuration the other commands would use.

use crate::ui;
use anyhow::Context;
use remora_kernel::config::{default_config_path, load_config};
use std::path::Path;

pub fn cmd_config(config_path: Option<&Path>) -> anyhow::Result<()> {
    let mut config = load_config(config_path);
    let path = config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config.network.shared_secret.is_empty() {
        config.network.shared_secret = "<redacted>".to_string();
    }
    let body = toml::to_string_pretty(&config).context("Failed to render config")?;

    ui::kv("Config file", &path.display().to_string());
    ui::blank();
    println!("{body}");
    Ok(())
}
