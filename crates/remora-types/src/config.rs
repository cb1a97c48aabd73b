//! Dispatcher and network configuration.
//!
//! Every field has a default so a partial (or empty) TOML file is valid.

use crate::error::{RemoraError, RemoraResult};
use serde::{Deserialize, Serialize};

/// Top-level configuration, usually loaded from `~/.remora/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoraConfig {
    /// How long `quit()` waits for each remote acknowledgement.
    pub quit_timeout_ms: u64,
    /// Upper bound on a single remote invocation or attribute access.
    pub invoke_timeout_ms: u64,
    /// Maximum number of proxies registered at once.
    pub max_proxies: usize,
    /// Entries kept in the delivery history ring buffer.
    pub history_size: usize,
    /// Transport settings.
    pub network: NetworkConfig,
}

impl Default for RemoraConfig {
    fn default() -> Self {
        Self {
            quit_timeout_ms: 2_000,
            invoke_timeout_ms: 5_000,
            max_proxies: 255,
            history_size: 1_000,
            network: NetworkConfig::default(),
        }
    }
}

impl RemoraConfig {
    /// Reject values the dispatcher cannot run with.
    pub fn validate(&self) -> RemoraResult<()> {
        if self.quit_timeout_ms == 0 {
            return Err(RemoraError::Config("quit_timeout_ms must be > 0".into()));
        }
        if self.invoke_timeout_ms == 0 {
            return Err(RemoraError::Config("invoke_timeout_ms must be > 0".into()));
        }
        if self.max_proxies == 0 {
            return Err(RemoraError::Config("max_proxies must be > 0".into()));
        }
        Ok(())
    }
}

/// `[network]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address a host node listens on.
    pub listen_addr: String,
    /// Human-readable name of this node.
    pub node_name: String,
    /// Pre-shared key for the HMAC handshake. Nodes refuse to start without it.
    pub shared_secret: String,
    /// Seed hosts contacted by `discover()`.
    pub peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            node_name: "remora-node".to_string(),
            shared_secret: String::new(),
            peers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RemoraConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_proxies, 255);
        assert!(config.network.peers.is_empty());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RemoraConfig = toml::from_str(
            r#"
            quit_timeout_ms = 500

            [network]
            shared_secret = "s3cret"
            peers = ["127.0.0.1:7400"]
            "#,
        )
        .unwrap();
        assert_eq!(config.quit_timeout_ms, 500);
        assert_eq!(config.invoke_timeout_ms, 5_000);
        assert_eq!(config.network.shared_secret, "s3cret");
        assert_eq!(config.network.node_name, "remora-node");
        assert_eq!(config.network.peers, vec!["127.0.0.1:7400".to_string()]);
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = RemoraConfig {
            max_proxies: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RemoraError::Config(_))));
    }
}
