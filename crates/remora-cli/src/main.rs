//! Remora CLI: a sample object host and a demo controller for it.
//!
//! `remora host` serves `TestSample1` and `TestSample2` over TCP;
//! `remora demo` discovers them and drives `TestSample2`'s timer.

mod cli;
mod cmd;
mod samples;
mod ui;

use crate::cli::{Cli, Commands};
use crate::cmd::demo::DemoOptions;
use clap::Parser;

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Host { listen, secret } => cmd::host::cmd_host(config, listen, secret),
        Commands::Demo {
            peers,
            secret,
            period,
            stop_at,
            remote_timer,
        } => cmd::demo::cmd_demo(
            config,
            DemoOptions {
                peers,
                secret,
                period,
                stop_at,
                remote_timer,
            },
        ),
        Commands::Config => cmd::config::cmd_config(config),
    };

    if let Err(e) = result {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_demo_flags() {
        let cli = Cli::parse_from([
            "remora", "demo", "--peer", "127.0.0.1:7400", "--peer", "127.0.0.1:7401",
            "--stop-at", "20", "--remote-timer",
        ]);
        match cli.command {
            Commands::Demo {
                peers,
                period,
                stop_at,
                remote_timer,
                ..
            } => {
                assert_eq!(peers.len(), 2);
                assert_eq!(period, 1000);
                assert_eq!(stop_at, 20);
                assert!(remote_timer);
            }
            _ => panic!("expected demo"),
        }
    }

    #[test]
    fn test_cli_global_config_flag() {
        let cli = Cli::parse_from(["remora", "host", "--config", "/tmp/remora.toml"]);
        assert_eq!(
            cli.config.as_deref(),
            Some(std::path::Path::new("/tmp/remora.toml"))
        );
        assert!(matches!(cli.command, Commands::Host { .. }));
    }
}
