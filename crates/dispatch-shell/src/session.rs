//! Per-session executor (C7): `IDLE -> RUNNING(cmd, original_request_id) ->
//! IDLE` state machine that actually shells out to run one command at a
//! time for one bound client, plus the `Session` record the Listener keeps
//! to track it.
//!
//! Grounded on `original_source/src/remote_shell/local_server_node.cc`'s
//! request/response shape (an `ExecuteCommand` is acked immediately,
//! streamed output arrives as separate pushed `ExecuteOutput` messages) and
//! `chaosgarden::ipc::server::GardenServer`'s dual role of owning both an
//! inbound `Handler` and an outbound push channel to a peer.

use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use dispatch_proto::{DpeClient, FileArg, Handler, Header, Payload, Request, Response, RetryConfig};

/// A session as tracked by the Listener: who's connected, where their
/// executor lives, and when their heartbeat expires.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: i64,
    pub client_address: String,
    pub executor_address: String,
    pub heartbeat_deadline: Instant,
}

impl Session {
    pub fn new(session_id: i64, client_address: String, executor_address: String, heartbeat_timeout: Duration) -> Self {
        Self {
            session_id,
            client_address,
            executor_address,
            heartbeat_deadline: Instant::now() + heartbeat_timeout,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.heartbeat_deadline
    }
}

enum RunState {
    Idle,
    Running { child: Child },
}

/// Handles every request a client sends to one session's executor:
/// `ExecuteCommand`, `DeleteSession`, `SessionHeartBeat`, `FileOperation`.
///
/// Holds a `Weak` self-reference (built with `Arc::new_cyclic`) so `handle`
/// can hand `Arc<Executor>` clones to its output-streaming tasks without the
/// caller needing to pass one in; the registry in `listener.rs` holds the
/// only strong `Arc`.
pub struct Executor {
    session_id: i64,
    client: Arc<DpeClient>,
    run_state: Mutex<RunState>,
    last_heartbeat: Mutex<Instant>,
    heartbeat_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
    next_push_id: AtomicI64,
    self_weak: Weak<Executor>,
}

impl Executor {
    pub fn new(
        session_id: i64,
        client_address: &str,
        heartbeat_timeout: Duration,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Arc<Self>> {
        let identity = format!("executor-{session_id}");
        let client = DpeClient::connect(client_address, identity.as_bytes(), RetryConfig::default().with_retries(0))?;
        Ok(Arc::new_cyclic(|weak| Self {
            session_id,
            client,
            run_state: Mutex::new(RunState::Idle),
            last_heartbeat: Mutex::new(Instant::now()),
            heartbeat_timeout,
            shutdown_tx,
            next_push_id: AtomicI64::new(1),
            self_weak: weak.clone(),
        }))
    }

    /// Spawns the heartbeat watchdog; fires the session's shutdown signal
    /// if no heartbeat arrives within `heartbeat_timeout` (same effect on
    /// the session as an explicit `DeleteSession`).
    pub fn spawn_watchdog(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.heartbeat_timeout / 4);
            loop {
                ticker.tick().await;
                let last = *this.last_heartbeat.lock().await;
                if last.elapsed() > this.heartbeat_timeout {
                    warn!(session_id = this.session_id, "session heartbeat timed out, terminating");
                    this.kill_running().await;
                    let _ = this.shutdown_tx.send(());
                    break;
                }
            }
        });
    }

    async fn kill_running(&self) {
        let mut state = self.run_state.lock().await;
        if let RunState::Running { child } = &mut *state {
            let _ = child.kill().await;
        }
        *state = RunState::Idle;
    }

    async fn push(&self, original_request_id: i64, output: String, is_exit: bool, exit_code: i32) {
        let mut header = Header::new("execute_output");
        header.session_id = self.session_id;
        header.request_id = self.next_push_id.fetch_add(1, Ordering::Relaxed);
        let payload = Payload::ExecuteOutput { original_request_id, output, is_exit, exit_code };
        if let Err(e) = self.client.request(header, payload).await {
            debug!(session_id = self.session_id, error = %e, "failed to push output to client (client likely gone)");
        }
    }

    /// Spawns `cmd` and streams its stdout/stderr back to the client as
    /// they arrive, followed by a final `ExecuteOutput{is_exit: true}`
    /// carrying the exit code. Rejects a second command while one is
    /// already running (the executor runs at most one command at a time).
    async fn execute(&self, original_request_id: i64, cmd: String, args: Vec<String>) -> Result<(), String> {
        {
            let state = self.run_state.lock().await;
            if matches!(*state, RunState::Running { .. }) {
                return Err("a command is already running in this session".into());
            }
        }

        let mut command = tokio::process::Command::new(&cmd);
        command.args(&args).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|e| format!("failed to spawn {cmd}: {e}"))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        *self.run_state.lock().await = RunState::Running { child };

        let Some(this) = self.self_weak.upgrade() else {
            return Err("executor torn down before command could be streamed".into());
        };

        if let Some(stdout) = stdout {
            let this = this.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    this.push(original_request_id, format!("{line}\n"), false, 0).await;
                }
            });
        }
        if let Some(stderr) = stderr {
            let this = this.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    this.push(original_request_id, format!("{line}\n"), false, 0).await;
                }
            });
        }

        tokio::spawn(async move {
            // Poll rather than hold the lock across `child.wait()` so
            // `DeleteSession` can still grab the lock to kill the process.
            let exit_code = loop {
                let mut state = this.run_state.lock().await;
                match &mut *state {
                    RunState::Running { child } => match child.try_wait() {
                        Ok(Some(status)) => break status.code().unwrap_or(-1),
                        Ok(None) => drop(state),
                        Err(_) => break -1,
                    },
                    RunState::Idle => return, // killed out from under us
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            };
            *this.run_state.lock().await = RunState::Idle;
            this.push(original_request_id, String::new(), true, exit_code).await;
            info!(session_id = this.session_id, exit_code, "command finished");
        });

        Ok(())
    }

    async fn handle_file_operation(&self, cmd: String, args: Vec<FileArg>) -> Response {
        let header = Header::new("file_operation");

        match cmd.as_str() {
            "fs" => {
                for arg in &args {
                    let FileArg::PathAndBytes(path, bytes) = arg else {
                        return Response::error(header, 1);
                    };
                    if let Err(e) = std::fs::write(path, bytes) {
                        error!(path, error = %e, "failed to write pushed file");
                        return Response::error(header, 2);
                    }
                    info!(path, bytes = bytes.len(), "received file");
                }
                Response::ok(header, Payload::FileOperation { cmd, args: Vec::new() })
            }
            "fg" => {
                let mut reply_args = Vec::with_capacity(args.len());
                for arg in &args {
                    let FileArg::Path(path) = arg else {
                        return Response::error(header, 1);
                    };
                    match std::fs::read(path) {
                        Ok(bytes) => reply_args.push(FileArg::PathAndBytes(path.clone(), bytes)),
                        Err(e) => {
                            error!(path, error = %e, "failed to read requested file");
                            return Response::error(header, 3);
                        }
                    }
                }
                Response::ok(header, Payload::FileOperation { cmd, args: reply_args })
            }
            other => {
                warn!(cmd = other, "unrecognized file operation");
                Response::error(header, 4)
            }
        }
    }
}

#[async_trait]
impl Handler for Executor {
    async fn handle(&self, request: Request) -> Response {
        let header = request.header;
        if header.session_id != 0 && header.session_id != self.session_id {
            return Response::error(header, 10);
        }

        match request.payload {
            Payload::ExecuteCommand { cmd, args, .. } => match self.execute(header.request_id, cmd, args).await {
                Ok(()) => Response::ok(header, Payload::Ack),
                Err(e) => {
                    warn!(session_id = self.session_id, error = %e, "failed to execute command");
                    Response::error(header, 11)
                }
            },
            Payload::DeleteSession => {
                info!(session_id = self.session_id, "session deleted by client");
                self.kill_running().await;
                let _ = self.shutdown_tx.send(());
                Response::ok(header, Payload::Ack)
            }
            Payload::SessionHeartBeat => {
                *self.last_heartbeat.lock().await = Instant::now();
                Response::ok(header, Payload::Ack)
            }
            Payload::FileOperation { cmd, args } => self.handle_file_operation(cmd, args).await,
            other => {
                warn!(payload = ?other, "unrecognized request at executor");
                Response::error(header, 99)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_expires_after_deadline() {
        let session = Session::new(1, "tcp://127.0.0.1:1".into(), "tcp://127.0.0.1:2".into(), Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(session.is_expired(Instant::now()));
    }

    #[test]
    fn session_not_expired_immediately() {
        let session = Session::new(1, "tcp://127.0.0.1:1".into(), "tcp://127.0.0.1:2".into(), Duration::from_secs(35));
        assert!(!session.is_expired(Instant::now()));
    }

    fn test_executor() -> Arc<Executor> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Executor::new(1, "tcp://127.0.0.1:1", Duration::from_secs(35), shutdown_tx).unwrap()
    }

    #[tokio::test]
    async fn file_get_reads_requested_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, b"hello").unwrap();

        let executor = test_executor();
        let response = executor
            .handle_file_operation("fg".into(), vec![FileArg::Path(path.to_string_lossy().into_owned())])
            .await;

        assert!(response.is_ok());
        let Payload::FileOperation { args, .. } = response.payload else { panic!("wrong payload") };
        let FileArg::PathAndBytes(_, bytes) = &args[0] else { panic!("wrong arg") };
        assert_eq!(bytes, b"hello");
    }

    #[tokio::test]
    async fn file_send_writes_pushed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");

        let executor = test_executor();
        let response = executor
            .handle_file_operation(
                "fs".into(),
                vec![FileArg::PathAndBytes(path.to_string_lossy().into_owned(), b"world".to_vec())],
            )
            .await;

        assert!(response.is_ok());
        assert_eq!(std::fs::read(&path).unwrap(), b"world");
    }

    #[tokio::test]
    async fn file_operation_rejects_unknown_cmd() {
        let executor = test_executor();
        let response = executor.handle_file_operation("mv".into(), vec![]).await;
        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn second_execute_while_running_is_rejected() {
        let executor = test_executor();
        executor.execute(1, "sleep".into(), vec!["1".into()]).await.unwrap();
        let second = executor.execute(2, "echo".into(), vec!["hi".into()]).await;
        assert!(second.is_err());
        executor.kill_running().await;
    }
}
