//! Init and node start.

use crate::ui;
use peermesh_kernel::config::{default_config_path, render_config};
use peermesh_kernel::{KernelError, MeshKernel};
use peermesh_types::config::MeshConfig;
use std::path::{Path, PathBuf};

/// Flags given to `peermesh start`.
#[derive(Debug, Default)]
pub struct StartOverrides {
    pub port: Option<u16>,
    pub discovery_port: Option<u16>,
    pub peers: Vec<String>,
    pub no_discovery: bool,
}

impl StartOverrides {
    /// Fold command-line flags into the loaded config.
    pub fn apply(self, config: &mut MeshConfig) {
        if let Some(port) = self.port {
            config.mesh_port = port;
        }
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
        }
        for peer in self.peers {
            if !config.static_peers.contains(&peer) {
                config.static_peers.push(peer);
            }
        }
        if self.no_discovery {
            config.discovery_enabled = false;
        }
    }
}

pub fn cmd_init(config: Option<PathBuf>, force: bool) {
    let path = config.unwrap_or_else(default_config_path);
    match write_default_config(&path, force) {
        Ok(()) => {
            ui::success(&format!("Wrote {}", path.display()));
            ui::hint("Edit it, then run `peermesh start`");
        }
        Err(InitError::Exists) => {
            ui::error_with_fix(
                &format!("{} already exists", path.display()),
                "Re-run with --force to overwrite it",
            );
            std::process::exit(1);
        }
        Err(InitError::Failed(msg)) => {
            ui::error(&format!("Failed to write {}: {msg}", path.display()));
            std::process::exit(1);
        }
    }
}

#[derive(Debug)]
enum InitError {
    Exists,
    Failed(String),
}

fn write_default_config(path: &Path, force: bool) -> Result<(), InitError> {
    if path.exists() && !force {
        return Err(InitError::Exists);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| InitError::Failed(e.to_string()))?;
    }
    let rendered =
        render_config(&MeshConfig::default()).map_err(|e| InitError::Failed(e.to_string()))?;
    std::fs::write(path, rendered).map_err(|e| InitError::Failed(e.to_string()))
}

pub fn cmd_start(mut config: MeshConfig, overrides: StartOverrides) {
    overrides.apply(&mut config);

    ui::banner();
    ui::blank();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    };
    rt.block_on(async {
        let kernel = match MeshKernel::boot_with_config(config).await {
            Ok(k) => k,
            Err(e) => {
                boot_kernel_error(&e);
                std::process::exit(1);
            }
        };

        print_node(&kernel);

        if let Err(e) = tokio::signal::ctrl_c().await {
            ui::error(&format!("Failed to listen for Ctrl+C: {e}"));
        }

        ui::blank();
        println!("  Shutting down...");
        kernel.shutdown().await;
        ui::success("PeerMesh node stopped");
    });
}

fn print_node(kernel: &MeshKernel) {
    let config = kernel.config();
    ui::success(&format!("Node {} booted", kernel.node_id()));
    ui::blank();
    match kernel.local_addr() {
        Some(addr) => ui::kv_ok("Mesh", &addr.to_string()),
        None => ui::warn("Mesh networking disabled (local routing only)"),
    }
    if config.mesh_enabled && config.discovery_enabled {
        ui::kv("Discovery", &format!("udp/{}", config.discovery_port));
    } else {
        ui::kv("Discovery", "off");
    }
    if !config.static_peers.is_empty() {
        ui::kv("Peers", &config.static_peers.join(", "));
    }
    ui::blank();
    ui::hint("Press Ctrl+C to stop the node");
    ui::blank();
}

fn boot_kernel_error(e: &KernelError) {
    match e {
        KernelError::BootFailed(msg) => ui::error_with_fix(
            &format!("Failed to boot node: {msg}"),
            "Is another node using the port? Try `peermesh start --port <PORT>`",
        ),
        other => ui::error_with_fix(
            &format!("Failed to boot node: {other}"),
            "Check your configuration with `peermesh config`",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_apply_to_config() {
        let mut config = MeshConfig {
            static_peers: vec!["10.0.0.2:7400".to_string()],
            ..Default::default()
        };
        StartOverrides {
            port: Some(7500),
            discovery_port: Some(7501),
            peers: vec!["10.0.0.2:7400".to_string(), "10.0.0.3:7400".to_string()],
            no_discovery: true,
        }
        .apply(&mut config);

        assert_eq!(config.mesh_port, 7500);
        assert_eq!(config.discovery_port, 7501);
        assert_eq!(config.static_peers, vec!["10.0.0.2:7400", "10.0.0.3:7400"]);
        assert!(!config.discovery_enabled);
    }

    #[test]
    fn test_empty_overrides_keep_config() {
        let mut config = MeshConfig::default();
        StartOverrides::default().apply(&mut config);
        assert_eq!(config, MeshConfig::default());
    }

    #[test]
    fn test_init_writes_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        write_default_config(&path, false).unwrap();
        let loaded = peermesh_kernel::config::read_config(&path).unwrap();
        assert_eq!(loaded, MeshConfig::default());
    }

    #[test]
    fn test_init_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "mesh_port = 9000\n").unwrap();

        assert!(matches!(
            write_default_config(&path, false),
            Err(InitError::Exists)
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "mesh_port = 9000\n");

        write_default_config(&path, true).unwrap();
        assert_ne!(std::fs::read_to_string(&path).unwrap(), "mesh_port = 9000\n");
    }
}
