//! `peermesh config`: show the effective configuration.

use crate::ui;
use peermesh_kernel::config::render_config;
use peermesh_types::config::MeshConfig;

pub fn cmd_config(config: &MeshConfig) {
    if let Err(e) = config.validate() {
        ui::warn(&format!("Configuration problem: {e}"));
    }
    match render_config(config) {
        Ok(rendered) => print!("{rendered}"),
        Err(e) => {
            ui::error(&format!("Failed to render config: {e}"));
            std::process::exit(1);
        }
    }
}
