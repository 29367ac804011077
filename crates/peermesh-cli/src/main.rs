//! PeerMesh CLI: runs a mesh node in the foreground and manages its config.

mod cli;
mod cmd;
mod ui;

use crate::cli::{Cli, Commands};
use clap::Parser;
use peermesh_kernel::config::load_config;
use tracing_subscriber::EnvFilter;

/// Log to stderr. `RUST_LOG` wins over the configured level.
fn init_tracing(default_level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            init_tracing("warn", cli.json_logs);
            cmd::init::cmd_init(cli.config, force);
        }
        Commands::Start {
            port,
            discovery_port,
            peers,
            no_discovery,
        } => {
            let config = load_config(cli.config.as_deref());
            init_tracing(&config.log_level, cli.json_logs);
            cmd::init::cmd_start(
                config,
                cmd::init::StartOverrides {
                    port,
                    discovery_port,
                    peers,
                    no_discovery,
                },
            );
        }
        Commands::Config => {
            init_tracing("warn", cli.json_logs);
            let config = load_config(cli.config.as_deref());
            cmd::config::cmd_config(&config);
        }
    }
}
