//! Config file discovery, loading, and environment variable overlay.

use std::env;
use std::path::{Path, PathBuf};

use crate::infra::{MasterConfig, ShellConfig, WorkerConfig};
use crate::{ConfigError, DispatchConfig};

/// Information about where config values came from, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub files: Vec<PathBuf>,
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations, in load order (later wins).
/// Only returns files that exist.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/dispatch/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("dispatch/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("dispatch.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file, applying it as an overlay onto defaults.
pub fn load_from_file(path: &Path) -> Result<DispatchConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    parse_toml(&contents, path)
}

fn parse_toml(contents: &str, path: &Path) -> Result<DispatchConfig, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut config = DispatchConfig::default();

    if let Some(section) = table.get("master") {
        config.master = deserialize_section(section, path)?;
    }
    if let Some(section) = table.get("worker") {
        config.worker = deserialize_section(section, path)?;
    }
    if let Some(section) = table.get("shell") {
        config.shell = deserialize_section(section, path)?;
    }

    Ok(config)
}

fn deserialize_section<T: serde::de::DeserializeOwned>(
    value: &toml::Value,
    path: &Path,
) -> Result<T, ConfigError> {
    value.clone().try_into().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge two configs, with `overlay` taking precedence field-by-field
/// wherever the overlay's value differs from that section's default.
pub fn merge_configs(base: DispatchConfig, overlay: DispatchConfig) -> DispatchConfig {
    DispatchConfig {
        master: merge_master(base.master, overlay.master),
        worker: merge_worker(base.worker, overlay.worker),
        shell: merge_shell(base.shell, overlay.shell),
    }
}

macro_rules! overlay_field {
    ($base:expr, $overlay:expr, $default:expr, $field:ident) => {
        if $overlay.$field != $default.$field {
            $overlay.$field
        } else {
            $base.$field
        }
    };
}

fn merge_master(base: MasterConfig, overlay: MasterConfig) -> MasterConfig {
    let default = MasterConfig::default();
    MasterConfig {
        ip: overlay_field!(base, overlay, default, ip),
        port: overlay_field!(base, overlay, default, port),
        http_port: overlay_field!(base, overlay, default, http_port),
        liveness_threshold_secs: overlay_field!(base, overlay, default, liveness_threshold_secs),
        tick_interval_ms: overlay_field!(base, overlay, default, tick_interval_ms),
        state_dir: overlay_field!(base, overlay, default, state_dir),
        snapshot_interval_secs: overlay_field!(base, overlay, default, snapshot_interval_secs),
        skip_load_state: overlay.skip_load_state || base.skip_load_state,
        log_level: overlay_field!(base, overlay, default, log_level),
    }
}

fn merge_worker(base: WorkerConfig, overlay: WorkerConfig) -> WorkerConfig {
    let default = WorkerConfig::default();
    WorkerConfig {
        ip: overlay_field!(base, overlay, default, ip),
        server_ip: overlay_field!(base, overlay, default, server_ip),
        server_port: overlay_field!(base, overlay, default, server_port),
        port: overlay_field!(base, overlay, default, port),
        http_port: overlay_field!(base, overlay, default, http_port),
        liveness_threshold_secs: overlay_field!(base, overlay, default, liveness_threshold_secs),
        log_level: overlay_field!(base, overlay, default, log_level),
    }
}

fn merge_shell(base: ShellConfig, overlay: ShellConfig) -> ShellConfig {
    let default = ShellConfig::default();
    ShellConfig {
        listener_port: overlay_field!(base, overlay, default, listener_port),
        client_port_min: overlay_field!(base, overlay, default, client_port_min),
        client_port_max: overlay_field!(base, overlay, default, client_port_max),
        log_level: overlay_field!(base, overlay, default, log_level),
    }
}

/// Apply `DISPATCH_*` environment variable overrides.
pub fn apply_env_overrides(config: &mut DispatchConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("DISPATCH_MASTER_IP") {
        config.master.ip = v;
        sources.env_overrides.push("DISPATCH_MASTER_IP".to_string());
    }
    if let Ok(v) = env::var("DISPATCH_MASTER_PORT") {
        if let Ok(port) = v.parse() {
            config.master.port = port;
            sources.env_overrides.push("DISPATCH_MASTER_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("DISPATCH_STATE_DIR") {
        config.master.state_dir = PathBuf::from(v);
        sources.env_overrides.push("DISPATCH_STATE_DIR".to_string());
    }
    if let Ok(v) = env::var("DISPATCH_WORKER_SERVER_IP") {
        config.worker.server_ip = v;
        sources.env_overrides.push("DISPATCH_WORKER_SERVER_IP".to_string());
    }
    if let Ok(v) = env::var("DISPATCH_WORKER_PORT") {
        if let Ok(port) = v.parse() {
            config.worker.port = port;
            sources.env_overrides.push("DISPATCH_WORKER_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("DISPATCH_SHELL_LISTENER_PORT") {
        if let Ok(port) = v.parse() {
            config.shell.listener_port = port;
            sources.env_overrides.push("DISPATCH_SHELL_LISTENER_PORT".to_string());
        }
    }
    if let Ok(v) = env::var("DISPATCH_LOG_LEVEL") {
        config.master.log_level = v.clone();
        config.worker.log_level = v.clone();
        config.shell.log_level = v;
        sources.env_overrides.push("DISPATCH_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG as a blanket override, matching hooteconf's precedent.
    if let Ok(v) = env::var("RUST_LOG") {
        config.master.log_level = v.clone();
        config.worker.log_level = v.clone();
        config.shell.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_toml() {
        let toml = r#"
[master]
port = 9310
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.master.port, 9310);
        assert_eq!(config.master.liveness_threshold_secs, 35);
    }

    #[test]
    fn parse_all_sections() {
        let toml = r#"
[master]
ip = "10.0.0.1"
port = 9310
state_dir = "/data/dispatch"

[worker]
server_ip = "10.0.0.1"
server_port = 9310

[shell]
listener_port = 4331
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.master.ip, "10.0.0.1");
        assert_eq!(config.master.state_dir, PathBuf::from("/data/dispatch"));
        assert_eq!(config.worker.server_port, 9310);
        assert_eq!(config.shell.listener_port, 4331);
    }

    #[test]
    fn merge_prefers_overlay_nondefault_fields() {
        let base = DispatchConfig::default();
        let mut overlay = DispatchConfig::default();
        overlay.master.port = 9999;
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.master.port, 9999);
        assert_eq!(merged.master.liveness_threshold_secs, 35);
    }

    #[test]
    fn env_overrides_apply() {
        std::env::set_var("DISPATCH_MASTER_PORT", "7777");
        let mut config = DispatchConfig::default();
        let mut sources = ConfigSources::default();
        apply_env_overrides(&mut config, &mut sources);
        assert_eq!(config.master.port, 7777);
        assert!(sources.env_overrides.contains(&"DISPATCH_MASTER_PORT".to_string()));
        std::env::remove_var("DISPATCH_MASTER_PORT");
    }
}
