//! Layered configuration loading for `dispatch-master`, `dispatch-worker`,
//! and `dispatch-shell`.
//!
//! # Configuration Philosophy
//!
//! All three binaries share one `dispatch.toml`/environment namespace but
//! only read the section relevant to them. Every field is infrastructure in
//! `hooteconf`'s sense — fixed at process start, never mutated afterwards;
//! there is no bootstrap-vs-runtime split here since the scheduler's actual
//! runtime state (registry, queue) lives in `dispatch-master`, not in config.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/dispatch/config.toml` (system)
//! 2. `~/.config/dispatch/config.toml` (user)
//! 3. `./dispatch.toml` (local override, or a CLI-supplied path)
//! 4. `DISPATCH_*` environment variables
//!
//! # Example Config
//!
//! ```toml
//! [master]
//! ip = "0.0.0.0"
//! port = 3310
//! state_dir = "/var/lib/dispatch"
//!
//! [worker]
//! server_ip = "10.0.0.5"
//! server_port = 3310
//! port = 3320
//!
//! [shell]
//! listener_port = 3331
//! ```

pub mod infra;
pub mod loader;

pub use infra::{MasterConfig, ShellConfig, WorkerConfig};
pub use loader::ConfigSources;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead { path: PathBuf, source: std::io::Error },

    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Full configuration surface; each binary loads this and reads its own
/// section.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DispatchConfig {
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

impl DispatchConfig {
    /// Load configuration from all sources, using the default search path.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, honoring an explicit CLI-supplied config path.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = DispatchConfig::default();

        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);

        Ok((config, sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_ports() {
        let config = DispatchConfig::default();
        assert_eq!(config.master.port, 3310);
        assert_eq!(config.shell.listener_port, 3331);
    }

    #[test]
    fn load_works_with_no_config_files() {
        let config = DispatchConfig::load().unwrap();
        assert_eq!(config.master.port, 3310);
    }
}
