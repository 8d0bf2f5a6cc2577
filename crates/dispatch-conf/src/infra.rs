//! Infrastructure configuration — values fixed at process start for each
//! of the three dispatch binaries.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Master bind address, liveness/tick tuning, and persistence location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    /// Interface to bind the ROUTER socket on.
    #[serde(default = "MasterConfig::default_ip")]
    pub ip: String,

    /// ZMQ port workers and the scheduler's peers connect to.
    /// Default: 3310.
    #[serde(default = "MasterConfig::default_port")]
    pub port: u16,

    /// HTTP status/health port.
    #[serde(default = "MasterConfig::default_http_port")]
    pub http_port: u16,

    /// Seconds of silence before a node is considered lost.
    #[serde(default = "MasterConfig::default_liveness_threshold_secs")]
    pub liveness_threshold_secs: u64,

    /// Scheduler tick interval in milliseconds.
    #[serde(default = "MasterConfig::default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Directory holding the sled snapshot/journal tree.
    #[serde(default = "MasterConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Seconds between durable snapshots.
    #[serde(default = "MasterConfig::default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    /// Skip loading an existing snapshot on startup (fresh run).
    #[serde(default)]
    pub skip_load_state: bool,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "MasterConfig::default_log_level")]
    pub log_level: String,
}

impl MasterConfig {
    fn default_ip() -> String {
        "0.0.0.0".to_string()
    }

    fn default_port() -> u16 {
        3310
    }

    fn default_http_port() -> u16 {
        8310
    }

    fn default_liveness_threshold_secs() -> u64 {
        35
    }

    fn default_tick_interval_ms() -> u64 {
        1000
    }

    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/dispatch/master"))
            .unwrap_or_else(|| PathBuf::from(".local/share/dispatch/master"))
    }

    fn default_snapshot_interval_secs() -> u64 {
        30
    }

    fn default_log_level() -> String {
        "info".to_string()
    }

    pub fn bind_address(&self) -> String {
        format!("tcp://{}:{}", self.ip, self.port)
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            ip: Self::default_ip(),
            port: Self::default_port(),
            http_port: Self::default_http_port(),
            liveness_threshold_secs: Self::default_liveness_threshold_secs(),
            tick_interval_ms: Self::default_tick_interval_ms(),
            state_dir: Self::default_state_dir(),
            snapshot_interval_secs: Self::default_snapshot_interval_secs(),
            skip_load_state: false,
            log_level: Self::default_log_level(),
        }
    }
}

/// Worker's connection to the master and its own listen port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// This worker's own interface, advertised to the master as the
    /// callback address for dispatched tasks — must be dialable from the
    /// master, unlike a `0.0.0.0` bind address.
    #[serde(default = "WorkerConfig::default_ip")]
    pub ip: String,

    /// Master address to connect to.
    #[serde(default = "WorkerConfig::default_server_ip")]
    pub server_ip: String,

    /// Master's ZMQ port.
    #[serde(default = "MasterConfig::default_port")]
    pub server_port: u16,

    /// This worker's own listen port (for symmetrical callback addressing).
    #[serde(default = "WorkerConfig::default_port")]
    pub port: u16,

    /// HTTP status/health port.
    #[serde(default = "WorkerConfig::default_http_port")]
    pub http_port: u16,

    /// The master's configured liveness threshold, so the worker's
    /// heartbeat cadence (half this value, per §4.6) tracks an operator
    /// override instead of assuming the master's factory default.
    #[serde(default = "MasterConfig::default_liveness_threshold_secs")]
    pub liveness_threshold_secs: u64,

    #[serde(default = "MasterConfig::default_log_level")]
    pub log_level: String,
}

impl WorkerConfig {
    fn default_ip() -> String {
        "127.0.0.1".to_string()
    }

    fn default_server_ip() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        3320
    }

    fn default_http_port() -> u16 {
        8320
    }

    pub fn server_address(&self) -> String {
        format!("tcp://{}:{}", self.server_ip, self.server_port)
    }

    /// The address this worker advertises to the master as its callback
    /// address; must be reachable from the master, so it uses `self.ip`
    /// rather than a `0.0.0.0` bind-all address.
    pub fn listen_address(&self) -> String {
        format!("tcp://{}:{}", self.ip, self.port)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            ip: Self::default_ip(),
            server_ip: Self::default_server_ip(),
            server_port: MasterConfig::default_port(),
            port: Self::default_port(),
            http_port: Self::default_http_port(),
            liveness_threshold_secs: MasterConfig::default_liveness_threshold_secs(),
            log_level: MasterConfig::default_log_level(),
        }
    }
}

/// Remote-shell listener port and the local client's port-scan range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Listener port, default 3331.
    #[serde(default = "ShellConfig::default_listener_port")]
    pub listener_port: u16,

    /// Lower bound (inclusive) of the local client's port-scan range.
    #[serde(default = "ShellConfig::default_client_port_min")]
    pub client_port_min: u16,

    /// Upper bound (exclusive) of the local client's port-scan range.
    #[serde(default = "ShellConfig::default_client_port_max")]
    pub client_port_max: u16,

    #[serde(default = "MasterConfig::default_log_level")]
    pub log_level: String,
}

impl ShellConfig {
    fn default_listener_port() -> u16 {
        3331
    }

    /// Fixed fallback for the config system's own defaulting/merge logic,
    /// which needs a stable value to compare against. The actual per-run
    /// `3331 + rand(0..1000)` low end (matching the original's allocation
    /// rule) is computed once at listener startup when this default wasn't
    /// overridden by the operator — see `dispatch-shell`'s `run_listener`.
    fn default_client_port_min() -> u16 {
        4331
    }

    fn default_client_port_max() -> u16 {
        5000
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            listener_port: Self::default_listener_port(),
            client_port_min: Self::default_client_port_min(),
            client_port_max: Self::default_client_port_max(),
            log_level: MasterConfig::default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn master_defaults() {
        let m = MasterConfig::default();
        assert_eq!(m.port, 3310);
        assert_eq!(m.liveness_threshold_secs, 35);
        assert_eq!(m.bind_address(), "tcp://0.0.0.0:3310");
    }

    #[test]
    fn worker_defaults() {
        let w = WorkerConfig::default();
        assert_eq!(w.server_address(), "tcp://127.0.0.1:3310");
        assert_eq!(w.listen_address(), "tcp://127.0.0.1:3320");
        assert_eq!(w.liveness_threshold_secs, 35);
    }

    #[test]
    fn shell_defaults() {
        let s = ShellConfig::default();
        assert_eq!(s.listener_port, 3331);
        assert!(s.client_port_min > s.listener_port);
        assert!(s.client_port_max > s.client_port_min);
    }
}
