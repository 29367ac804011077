//! Clap CLI definitions for PeerMesh.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  peermesh init                         Write ~/.peermesh/config.toml
  peermesh start                        Join the mesh with the default config
  peermesh start --port 7500 --no-discovery --peer 10.0.0.2:7400
  peermesh config                       Print the effective configuration
  RUST_LOG=peermesh_wire=debug peermesh start";

/// PeerMesh: a peer-to-peer mesh orchestrator for local components.
#[derive(Parser)]
#[command(name = "peermesh", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a default config file (~/.peermesh/config.toml).
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Start a mesh node and run until Ctrl+C.
    Start {
        /// TCP port for mesh connections (overrides `mesh_port`).
        #[arg(long)]
        port: Option<u16>,
        /// UDP port for discovery (overrides `discovery_port`).
        #[arg(long)]
        discovery_port: Option<u16>,
        /// Static peer to dial, as host:port. Repeatable.
        #[arg(long = "peer", value_name = "ADDR")]
        peers: Vec<String>,
        /// Disable UDP discovery.
        #[arg(long)]
        no_discovery: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start_flags() {
        let cli = Cli::parse_from([
            "peermesh",
            "--config",
            "/tmp/mesh.toml",
            "start",
            "--port",
            "7500",
            "--peer",
            "10.0.0.2:7400",
            "--peer",
            "10.0.0.3:7400",
            "--no-discovery",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/mesh.toml")));
        match cli.command {
            Commands::Start {
                port,
                discovery_port,
                peers,
                no_discovery,
            } => {
                assert_eq!(port, Some(7500));
                assert_eq!(discovery_port, None);
                assert_eq!(peers, vec!["10.0.0.2:7400", "10.0.0.3:7400"]);
                assert!(no_discovery);
            }
            _ => panic!("expected start"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["peermesh", "init", "--force", "--json-logs"]);
        assert!(cli.json_logs);
        assert!(matches!(cli.command, Commands::Init { force: true }));
    }
}
