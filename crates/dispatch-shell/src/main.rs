use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use rustyline::DefaultEditor;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use dispatch_conf::DispatchConfig;
use dispatch_proto::{DpeClient, DpeServer, FileArg, Handler, Header, Payload, Request, Response, RetryConfig};
use dispatch_shell::{find_free_port, parser, Listener};

/// Remote-shell listener and interactive local client.
///
/// `listen` runs the long-lived Listener a client's `connect` dials into;
/// `connect` is the interactive client itself.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the remote-shell listener.
    Listen {
        #[arg(long)]
        config: Option<std::path::PathBuf>,
        #[arg(long)]
        ip: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        log: Option<String>,
    },
    /// Connect to a running listener and start an interactive session.
    Connect {
        /// Listener address, e.g. tcp://127.0.0.1:3331.
        address: String,
        #[arg(long)]
        config: Option<std::path::PathBuf>,
        /// Local port to bind for receiving streamed output; a random free
        /// port in the configured scan range is picked if omitted.
        #[arg(short, long)]
        port: Option<u16>,
        #[arg(short, long)]
        log: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Listen { config, ip, port, log } => run_listener(config, ip, port, log).await,
        Command::Connect { address, config, port, log } => run_client(address, config, port, log).await,
    }
}

async fn run_listener(
    config: Option<std::path::PathBuf>,
    ip: Option<String>,
    port: Option<u16>,
    log: Option<String>,
) -> Result<()> {
    let mut config = DispatchConfig::load_from(config.as_deref()).context("failed to load configuration")?.shell;
    let bind_ip = ip.unwrap_or_else(|| "0.0.0.0".to_string());
    if let Some(port) = port {
        config.listener_port = port;
    }
    if let Some(log) = log {
        config.log_level = log;
    }

    // An operator who never set client_port_min gets the original's per-run
    // random low end (3331 + rand(0..1000)) rather than the config system's
    // fixed fallback value, matching local_server_node.cc's allocation range.
    if config.client_port_min == dispatch_conf::ShellConfig::default().client_port_min {
        use rand::Rng;
        config.client_port_min = 3331 + rand::thread_rng().gen_range(0..1000u16);
    }

    init_tracing(&config.log_level);

    let listen_address = format!("tcp://{bind_ip}:{}", config.listener_port);
    info!(%listen_address, "starting remote-shell listener");

    let listener = Listener::new(bind_ip, config.client_port_min, config.client_port_max, Duration::from_secs(35));

    let server = match DpeServer::bind(&listen_address) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };
    let shutdown = server.shutdown_signal();
    let server_handle = tokio::spawn(server.run(listener));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }
    drop(shutdown);
    server_handle.abort();
    Ok(())
}

struct ClientOutputHandler {
    tx: mpsc::UnboundedSender<Payload>,
}

#[async_trait]
impl Handler for ClientOutputHandler {
    async fn handle(&self, request: Request) -> Response {
        let header = request.header;
        if let Payload::ExecuteOutput { .. } = &request.payload {
            let _ = self.tx.send(request.payload);
        }
        Response::ok(header, Payload::Ack)
    }
}

async fn run_client(
    listener_address: String,
    config: Option<std::path::PathBuf>,
    port: Option<u16>,
    log: Option<String>,
) -> Result<()> {
    let mut config = DispatchConfig::load_from(config.as_deref()).context("failed to load configuration")?.shell;
    if let Some(log) = log {
        config.log_level = log;
    }
    init_tracing(&config.log_level);

    let client_ip = "127.0.0.1";
    let client_port = match port {
        Some(p) => p,
        None => find_free_port(client_ip, config.client_port_min, config.client_port_max)
            .context("failed to find a free local port")?,
    };
    let client_address = format!("tcp://{client_ip}:{client_port}");

    let (output_tx, mut output_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(ClientOutputHandler { tx: output_tx });
    let server = DpeServer::bind(&client_address).context("failed to bind local client server")?;
    tokio::spawn(server.run(handler));
    info!(%client_address, "local client listening for streamed output");

    let listener_client = DpeClient::connect(&listener_address, b"shell-client", RetryConfig::default())
        .context("failed to connect to listener")?;

    let create_header = Header::new("create_session");
    let response = listener_client
        .request(create_header, Payload::CreateSession { address: client_address.clone() })
        .await
        .context("create_session request failed")?;
    let (session_id, executor_address) = match response.payload {
        Payload::SessionAck { session_id, address } => (session_id, address),
        _ => anyhow::bail!("listener returned unexpected reply to create_session"),
    };
    info!(session_id, %executor_address, "session established");

    let executor_client = DpeClient::connect(&executor_address, b"shell-client", RetryConfig::default())
        .context("failed to connect to executor")?;

    let heartbeat_client = executor_client.clone();
    let heartbeat_session_id = session_id;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            let mut header = Header::new("session_heartbeat");
            header.session_id = heartbeat_session_id;
            if let Err(e) = heartbeat_client.request(header, Payload::SessionHeartBeat).await {
                warn!(error = %e, "session heartbeat failed");
            }
        }
    });

    println!("connected, session {session_id}. type 'exit' or 'q' to leave.");
    let mut editor = DefaultEditor::new().context("failed to start line editor")?;

    loop {
        let line = match editor.readline("dispatch-shell> ") {
            Ok(line) => line,
            Err(_) => break,
        };
        let _ = editor.add_history_entry(line.as_str());
        let tokens = parser::tokenize(&line);
        let Some(verb) = tokens.first() else { continue };

        match verb.as_str() {
            "exit" | "q" => {
                let mut header = Header::new("delete_session");
                header.session_id = session_id;
                let _ = executor_client.request(header, Payload::DeleteSession).await;
                break;
            }
            "l" => {
                run_local(&tokens[1..]);
            }
            "fs" => {
                if let Err(e) = file_send(&executor_client, session_id, &tokens[1..]).await {
                    println!("fs failed: {e}");
                }
            }
            "fg" => {
                if let Err(e) = file_get(&executor_client, session_id, &tokens[1..]).await {
                    println!("fg failed: {e}");
                }
            }
            _ => {
                if let Err(e) = execute_remote(&executor_client, session_id, &client_address, &tokens, &mut output_rx).await {
                    println!("command failed: {e}");
                }
            }
        }
    }

    Ok(())
}

fn run_local(args: &[String]) {
    if args.is_empty() {
        return;
    }
    match std::process::Command::new(&args[0]).args(&args[1..]).output() {
        Ok(output) => {
            std::io::stdout().write_all(&output.stdout).ok();
            std::io::stderr().write_all(&output.stderr).ok();
        }
        Err(e) => println!("local command failed: {e}"),
    }
}

async fn file_send(client: &Arc<DpeClient>, session_id: i64, paths: &[String]) -> Result<()> {
    let mut args = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
        args.push(FileArg::PathAndBytes(path.clone(), bytes));
    }
    let mut header = Header::new("file_operation");
    header.session_id = session_id;
    let response = client.request(header, Payload::FileOperation { cmd: "fs".into(), args }).await?;
    if response.is_ok() {
        println!("sent {} file(s)", paths.len());
    } else {
        println!("send rejected, error_code={}", response.header.error_code);
    }
    Ok(())
}

async fn file_get(client: &Arc<DpeClient>, session_id: i64, paths: &[String]) -> Result<()> {
    let args = paths.iter().cloned().map(FileArg::Path).collect();
    let mut header = Header::new("file_operation");
    header.session_id = session_id;
    let response = client.request(header, Payload::FileOperation { cmd: "fg".into(), args }).await?;
    let Payload::FileOperation { args, .. } = response.payload else {
        anyhow::bail!("unexpected reply to fg");
    };
    for arg in args {
        let FileArg::PathAndBytes(path, bytes) = arg else { continue };
        let name = Path::new(&path).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or(path);
        std::fs::write(&name, &bytes).with_context(|| format!("failed to write {name}"))?;
        println!("wrote {name} ({} bytes)", bytes.len());
    }
    Ok(())
}

async fn execute_remote(
    client: &Arc<DpeClient>,
    session_id: i64,
    client_address: &str,
    tokens: &[String],
    output_rx: &mut mpsc::UnboundedReceiver<Payload>,
) -> Result<()> {
    let mut header = Header::new("execute_command");
    header.session_id = session_id;
    let response = client
        .request(
            header,
            Payload::ExecuteCommand {
                address: client_address.to_string(),
                cmd: tokens[0].clone(),
                args: tokens[1..].to_vec(),
            },
        )
        .await?;
    if !response.is_ok() {
        anyhow::bail!("executor rejected command, error_code={}", response.header.error_code);
    }

    while let Some(payload) = output_rx.recv().await {
        let Payload::ExecuteOutput { output, is_exit, exit_code, .. } = payload else { continue };
        if !output.is_empty() {
            print!("{output}");
            std::io::stdout().flush().ok();
        }
        if is_exit {
            if exit_code != 0 {
                println!("[exit code {exit_code}]");
            }
            break;
        }
    }
    Ok(())
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(log_level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();
}
