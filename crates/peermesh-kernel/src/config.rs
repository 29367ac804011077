//! Configuration loading from `~/.peermesh/config.toml` with defaults.
//!
//! A config file may list other TOML files under `include`. Includes are
//! merged in order and the including file is applied on top, so the root
//! always wins. Include paths are relative to the including file and may not
//! be absolute, contain `..`, form a cycle or nest deeper than
//! [`MAX_INCLUDE_DEPTH`].

use crate::error::KernelResult;
use peermesh_types::config::MeshConfig;
use peermesh_types::error::MeshError;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// Maximum include nesting depth.
pub const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load the mesh configuration, falling back to defaults on any error.
///
/// `None` reads [`default_config_path`]. A missing file is not an error.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return MeshConfig::default();
    }

    match read_config(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            MeshConfig::default()
        }
    }
}

/// Read, resolve includes and deserialize one config file. Errors are
/// reported instead of defaulted.
pub fn read_config(path: &Path) -> KernelResult<MeshConfig> {
    let canonical = std::fs::canonicalize(path)
        .map_err(|e| config_error(format!("cannot resolve {}: {e}", path.display())))?;
    let mut visited = HashSet::from([canonical.clone()]);
    let merged = resolve_file(&canonical, &mut visited, 0)?;
    let config = merged
        .try_into::<MeshConfig>()
        .map_err(|e| config_error(format!("invalid config {}: {e}", path.display())))?;
    Ok(config)
}

/// Render a config as TOML, as written by `peermesh init`.
pub fn render_config(config: &MeshConfig) -> KernelResult<String> {
    toml::to_string_pretty(config).map_err(|e| config_error(e.to_string()).into())
}

fn config_error(message: String) -> MeshError {
    MeshError::Config(message)
}

/// Parse `path` and fold its includes underneath it.
fn resolve_file(
    path: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> KernelResult<toml::Value> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| config_error(format!("cannot read {}: {e}", path.display())))?;
    let mut value: toml::Value = toml::from_str(&contents)
        .map_err(|e| config_error(format!("cannot parse {}: {e}", path.display())))?;

    let includes = take_includes(&mut value);
    if includes.is_empty() {
        return Ok(value);
    }
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(config_error(format!(
            "include depth exceeds {MAX_INCLUDE_DEPTH} at {}",
            path.display()
        ))
        .into());
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut base = toml::Value::Table(toml::map::Map::new());
    for include in &includes {
        let resolved = resolve_include_path(dir, include)?;
        if !visited.insert(resolved.clone()) {
            return Err(config_error(format!("circular include: {include}")).into());
        }
        info!(include = %include, "Loading config include");
        let included = resolve_file(&resolved, visited, depth + 1)?;
        deep_merge_toml(&mut base, &included);
    }
    deep_merge_toml(&mut base, &value);
    Ok(base)
}

/// Remove and return the `include` list of a parsed file.
fn take_includes(value: &mut toml::Value) -> Vec<String> {
    let Some(table) = value.as_table_mut() else {
        return Vec::new();
    };
    match table.remove("include") {
        Some(toml::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        Some(toml::Value::String(single)) => vec![single],
        _ => Vec::new(),
    }
}

fn resolve_include_path(dir: &Path, include: &str) -> KernelResult<PathBuf> {
    let relative = Path::new(include);
    if relative.is_absolute() {
        return Err(config_error(format!("include must be relative: {include}")).into());
    }
    if relative.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(config_error(format!("include may not contain '..': {include}")).into());
    }
    let canonical = std::fs::canonicalize(dir.join(relative))
        .map_err(|e| config_error(format!("cannot resolve include {include}: {e}")))?;
    if !canonical.starts_with(dir) {
        return Err(config_error(format!("include escapes config directory: {include}")).into());
    }
    Ok(canonical)
}

/// Deep-merge two TOML values. Tables merge key by key; for everything
/// else `overlay` replaces `base`.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(base_val) => deep_merge_toml(base_val, overlay_val),
                    None => {
                        base_tbl.insert(key.clone(), overlay_val.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Get the PeerMesh home directory.
pub fn peermesh_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".peermesh")
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    peermesh_home().join("config.toml")
}
