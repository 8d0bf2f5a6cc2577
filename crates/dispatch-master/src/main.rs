use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info};

use dispatch_conf::DispatchConfig;
use dispatch_master::{MasterHandler, Persistence, SchedulerConfig};
use dispatch_proto::{DpeServer, RetryConfig};
use dispatch_solver::SquareSumSolver;

/// Dispatch master: partitions a problem into tasks and schedules them
/// across a fluctuating fleet of workers.
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

    /// Interface to bind the master's ROUTER socket on.
    #[arg(long)]
    ip: Option<String>,

    /// Master's ZMQ port.
    #[arg(short, long)]
    port: Option<u16>,

    /// HTTP status port (unused by the scheduler core, kept for parity
    /// with the original flag surface).
    #[arg(long = "hp", alias = "http_port")]
    http_port: Option<u16>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(short, long)]
    log: Option<String>,

    /// Skip loading a previously saved snapshot; start with a fresh task set.
    #[arg(long)]
    skip_load_state: bool,

    /// Show loaded configuration and exit.
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DispatchConfig::load_from(cli.config.as_deref())
        .context("failed to load configuration")?
        .master;

    if let Some(ip) = cli.ip {
        config.ip = ip;
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
    config.skip_load_state |= cli.skip_load_state;

    if cli.show_config {
        println!("{config:#?}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info")
        }))
        .init();

    let bind_address = config.bind_address();
    info!(%bind_address, "starting dispatch master");

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("failed to create state directory {}", config.state_dir.display()))?;
    let persistence = Persistence::open(&config.state_dir)
        .with_context(|| format!("failed to open persistence store at {}", config.state_dir.display()))?;

    let solver = Arc::new(SquareSumSolver::default());
    let scheduler_config = SchedulerConfig {
        tick_interval: Duration::from_millis(config.tick_interval_ms),
        snapshot_interval: Duration::from_secs(config.snapshot_interval_secs),
        skip_load_state: config.skip_load_state,
        liveness_timeout: Duration::from_secs(config.liveness_threshold_secs),
    };

    let (cmd_tx, mut exit_rx) =
        dispatch_master::spawn_scheduler(solver, scheduler_config, Some(Arc::new(Mutex::new(persistence))));

    let handler = Arc::new(MasterHandler::new(cmd_tx, bind_address.clone(), RetryConfig::default()));

    let server = match DpeServer::bind(&bind_address) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to bind master listener");
            std::process::exit(1);
        }
    };
    let shutdown = server.shutdown_signal();
    let server_handle = tokio::spawn(server.run(handler));

    tokio::select! {
        result = exit_rx.recv() => {
            if result.is_ok() {
                info!("all tasks accounted for, shutting down");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }
    drop(shutdown);
    server_handle.abort();

    Ok(())
}
