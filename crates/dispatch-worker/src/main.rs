use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use dispatch_conf::DispatchConfig;
use dispatch_proto::RetryConfig;
use dispatch_solver::SquareSumSolver;
use dispatch_worker::WorkerRuntime;

/// Dispatch worker: registers with a master and executes compute tasks.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/dispatch/config.toml
/// 3. ~/.config/dispatch/config.toml
/// 4. ./dispatch.toml (or --config path)
/// 5. DISPATCH_* environment variables
/// 6. These CLI flags
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// This worker's own interface, advertised to the master as the
    /// callback address for dispatched tasks.
    #[arg(long)]
    ip: Option<String>,

    /// Master's address to connect to.
    #[arg(long)]
    server_ip: Option<String>,

    /// This worker's own listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP status port (unused by the scheduler core, kept for parity
    /// with the original flag surface).
    #[arg(long = "hp", alias = "http_port")]
    http_port: Option<u16>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(short, long)]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DispatchConfig::load_from(cli.config.as_deref())
        .context("failed to load configuration")?
        .worker;

    if let Some(ip) = cli.ip {
        config.ip = ip;
    }
    if let Some(server_ip) = cli.server_ip {
        config.server_ip = server_ip;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(http_port) = cli.http_port {
        config.http_port = http_port;
    }
    if let Some(log) = cli.log {
        config.log_level = log;
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info")
        }))
        .init();

    let listen_address = config.listen_address();
    let server_address = config.server_address();

    info!(%server_address, %listen_address, "starting dispatch worker");

    let solver = Arc::new(SquareSumSolver::default());
    let retry = RetryConfig::default();

    let runtime = match WorkerRuntime::connect(solver, &server_address, listen_address, retry).await {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to connect to master");
            std::process::exit(1);
        }
    };

    // Heartbeat at roughly half the master's liveness threshold, so a
    // change to the master's configured threshold doesn't silently starve
    // the worker's cadence relative to it.
    let heartbeat_interval = Duration::from_secs((config.liveness_threshold_secs / 2).max(1));
    if let Err(e) = runtime.run(heartbeat_interval).await {
        error!(error = %e, "worker run loop exited with error");
        std::process::exit(1);
    }

    Ok(())
}
