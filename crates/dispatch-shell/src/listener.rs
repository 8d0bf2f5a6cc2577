//! Remote-shell Listener: the single long-lived, well-known entry point a
//! local client dials first. Each `CreateSession` spawns a fresh per-session
//! `Executor` bound to its own scanned-free port and hands the client that
//! address directly in the reply.
//!
//! The original (`local_server_node.cc`) replies to `CreateSession` with
//! just a session id, then has the freshly spawned executor push its own
//! address to the client in a second round trip. `Payload::SessionAck`
//! already carries `{session_id, address}` together, so this port folds
//! that handoff into the listener's single reply — one fewer round trip for
//! the same information.

use std::collections::HashMap;
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use dispatch_proto::{DpeServer, Handler, Header, Payload, Request, Response};

use crate::session::{Executor, Session};

/// Scans `[min, max)` on `ip` for a port nothing is listening on yet, the
/// way the original's executor spawn loop probes for a free local port.
pub fn find_free_port(ip: &str, min: u16, max: u16) -> Result<u16> {
    use rand::Rng;
    if min >= max {
        return Err(anyhow!("invalid port range {min}..{max}"));
    }
    let span = (max - min) as u32;
    let start_offset = rand::thread_rng().gen_range(0..span);

    for i in 0..span {
        let port = min + ((start_offset + i) % span) as u16;
        if StdTcpListener::bind((ip, port)).is_ok() {
            return Ok(port);
        }
    }
    Err(anyhow!("no free port in {min}..{max} on {ip}"))
}

/// Tracks every live session and spawns executors for new ones. Built with
/// `Arc::new_cyclic` so `handle` (which only gets `&self`) can still hand
/// its own `Arc` clone to the spawned session-teardown task.
pub struct Listener {
    ip: String,
    executor_port_min: u16,
    executor_port_max: u16,
    heartbeat_timeout: Duration,
    sessions: Mutex<HashMap<i64, Session>>,
    next_session_id: AtomicI64,
    self_weak: Weak<Listener>,
}

impl Listener {
    pub fn new(ip: String, executor_port_min: u16, executor_port_max: u16, heartbeat_timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ip,
            executor_port_min,
            executor_port_max,
            heartbeat_timeout,
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicI64::new(1),
            self_weak: weak.clone(),
        })
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn create_session(&self, client_address: String) -> Result<(i64, String)> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let port = find_free_port(&self.ip, self.executor_port_min, self.executor_port_max)?;
        let executor_address = format!("tcp://{}:{}", self.ip, port);

        let (shutdown_tx, _) = broadcast::channel(1);
        let executor = Executor::new(session_id, &client_address, self.heartbeat_timeout, shutdown_tx.clone())?;
        executor.spawn_watchdog();

        let server = DpeServer::bind(&executor_address)?;
        let shutdown_rx = server.shutdown_signal();
        let server_handle = tokio::spawn(server.run(executor));

        if let Some(this) = self.self_weak.upgrade() {
            let mut shutdown_rx2 = shutdown_tx.subscribe();
            tokio::spawn(async move {
                let _ = shutdown_rx2.recv().await;
                drop(shutdown_rx);
                server_handle.abort();
                this.sessions.lock().await.remove(&session_id);
                info!(session_id, "session torn down");
            });
        }

        let session = Session::new(session_id, client_address, executor_address.clone(), self.heartbeat_timeout);
        self.sessions.lock().await.insert(session_id, session);

        info!(session_id, %executor_address, "session created");
        Ok((session_id, executor_address))
    }
}

#[async_trait]
impl Handler for Listener {
    async fn handle(&self, request: Request) -> Response {
        let header = request.header;
        match request.payload {
            Payload::CreateSession { address } => match self.create_session(address).await {
                Ok((session_id, executor_address)) => {
                    Response::ok(header, Payload::SessionAck { session_id, address: executor_address })
                }
                Err(e) => {
                    warn!(error = %e, "failed to create session");
                    Response::error(header, 1)
                }
            },
            other => {
                warn!(payload = ?other, "unrecognized request at listener");
                Response::error(header, 99)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_is_within_range() {
        let port = find_free_port("127.0.0.1", 15000, 15100).unwrap();
        assert!((15000..15100).contains(&port));
    }

    #[test]
    fn rejects_empty_range() {
        assert!(find_free_port("127.0.0.1", 100, 100).is_err());
    }
}
