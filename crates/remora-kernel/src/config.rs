//! Configuration loading from `~/.remora/config.toml` with defaults.

use remora_types::config::RemoraConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load configuration from a TOML file, with defaults.
///
/// A missing, unreadable, unparseable or invalid file is logged and replaced
/// by [`RemoraConfig::default`].
pub fn load_config(path: Option<&Path>) -> RemoraConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return RemoraConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            return RemoraConfig::default();
        }
    };

    let config = match toml::from_str::<RemoraConfig>(&contents) {
        Ok(config) => config,
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to parse config, using defaults"
            );
            return RemoraConfig::default();
        }
    };

    if let Err(e) = config.validate() {
        warn!(
            error = %e,
            path = %config_path.display(),
            "Invalid config, using defaults"
        );
        return RemoraConfig::default();
    }

    info!(path = %config_path.display(), "Loaded configuration");
    config
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    remora_home().join("config.toml")
}

/// Get the default Remora home directory.
pub fn remora_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".remora")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/config.toml")));
        assert_eq!(config, RemoraConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
            quit_timeout_ms = 750
            max_proxies = 16

            [network]
            node_name = "bench"
            shared_secret = "s3cret"
            peers = ["127.0.0.1:7400", "127.0.0.1:7401"]
            "#,
        );
        let config = load_config(Some(&path));
        assert_eq!(config.quit_timeout_ms, 750);
        assert_eq!(config.max_proxies, 16);
        assert_eq!(config.invoke_timeout_ms, 5_000);
        assert_eq!(config.network.node_name, "bench");
        assert_eq!(config.network.peers.len(), 2);
    }

    #[test]
    fn test_load_config_parse_error_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "quit_timeout_ms = \"soon\"");
        assert_eq!(load_config(Some(&path)), RemoraConfig::default());
    }

    #[test]
    fn test_load_config_invalid_values_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(&dir, "max_proxies = 0");
        assert_eq!(load_config(Some(&path)).max_proxies, 255);
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with(".remora/config.toml"));
    }
}
