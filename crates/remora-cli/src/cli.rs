//! Clap CLI definitions for Remora.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  remora host --secret s3cret --listen 127.0.0.1:7400
  remora demo --secret s3cret --peer 127.0.0.1:7400
  remora config                 Show the effective configuration";

/// Remora: discover remote objects and drive them through local proxies.
#[derive(Parser)]
#[command(name = "remora", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the TestSample1 and TestSample2 objects until both quit.
    Host {
        /// Address to listen on (overrides [network] listen_addr).
        #[arg(long)]
        listen: Option<String>,
        /// Shared secret (overrides [network] shared_secret).
        #[arg(long)]
        secret: Option<String>,
    },
    /// Discover the sample objects and drive TestSample2's timer.
    Demo {
        /// Host to discover (repeatable; added to [network] peers).
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Shared secret (overrides [network] shared_secret).
        #[arg(long)]
        secret: Option<String>,
        /// Timer period in milliseconds.
        #[arg(long, default_value_t = 1000)]
        period: u64,
        /// Tick at which the timer is disabled and the demo quits.
        #[arg(long, default_value_t = 30)]
        stop_at: u64,
        /// Use TestSample2's own timer (timerTriggerNo updates) instead of a
        /// dispatcher timer.
        #[arg(long)]
        remote_timer: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
}
