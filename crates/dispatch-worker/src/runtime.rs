//! Connect/register/compute/finish loop (C6).
//!
//! Grounded on `hooteproto::client`'s reactor + `spawn_health_task` pattern
//! for the outbound master connection, and `original_source/src/dpe/
//! dpe_worker_node.h`'s `WorkerTaskExecuter`/`DPEWorkerNode` split: a task
//! executor that owns the compute callback, and a node that owns the
//! transport. Here both halves live in one `WorkerRuntime` since nothing
//! else shares the executor in this Rust port.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use dispatch_proto::{
    spawn_heartbeat_task, DpeClient, DpeServer, Handler, Header, Payload, Request, Response,
    RetryConfig,
};
use dispatch_solver::Solver;

/// How many times `finishTask` is retried (with exponential backoff) before
/// the result is dropped and left for the master's liveness timer to
/// reclaim, per §4.6.
const FINISH_TASK_MAX_ATTEMPTS: u32 = 5;

pub struct WorkerRuntime {
    solver: Arc<dyn Solver>,
    master: Arc<DpeClient>,
    listen_address: String,
    connection_id: AtomicI64,
    retry: RetryConfig,
}

impl WorkerRuntime {
    /// Connects to the master at `server_address`, announcing
    /// `listen_address` as the callback address for dispatched tasks.
    /// Returns `Err` if the handshake does not complete.
    pub async fn connect(
        solver: Arc<dyn Solver>,
        server_address: &str,
        listen_address: String,
        retry: RetryConfig,
    ) -> Result<Arc<Self>> {
        let identity = format!("worker-{listen_address}");
        let master = DpeClient::connect(server_address, identity.as_bytes(), retry.clone())
            .with_context(|| format!("failed to set up dealer socket to master at {server_address}"))?;

        let header = Header::new("connect");
        let response = master
            .request(header, Payload::Connect { address: listen_address.clone() })
            .await
            .context("connect request to master failed")?;

        let connection_id = match (response.is_ok(), response.payload) {
            (true, Payload::ConnectAck { connection_id }) => connection_id,
            _ => anyhow::bail!("master rejected connect handshake, error_code={}", response.header.error_code),
        };

        info!(connection_id, %server_address, "connected to master");
        solver.init_as_worker();

        Ok(Arc::new(Self {
            solver,
            master,
            listen_address,
            connection_id: AtomicI64::new(connection_id),
            retry,
        }))
    }

    fn connection_id(&self) -> i64 {
        self.connection_id.load(Ordering::Relaxed)
    }

    /// Binds the ROUTER socket that receives `compute` dispatches and runs
    /// it to completion (until the server's shutdown signal fires).
    /// Also starts the periodic heartbeat task at roughly half the
    /// master's liveness threshold, per §4.6.
    pub async fn run(self: Arc<Self>, heartbeat_interval: Duration) -> Result<()> {
        let server = DpeServer::bind(&self.listen_address)
            .with_context(|| format!("failed to bind worker listener at {}", self.listen_address))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        spawn_heartbeat_task(
            self.master.clone(),
            self.connection_id(),
            heartbeat_interval,
            self.retry.max_failures,
            shutdown_rx,
        );

        let handler = Arc::new(WorkerHandler { runtime: self.clone() });
        let _ = shutdown_tx;
        info!(address = %self.listen_address, "worker listening for compute dispatches");
        server.run(handler).await
    }

    /// Runs one task through the solver and reports the result to the
    /// master, retrying `finishTask` with exponential backoff up to
    /// `FINISH_TASK_MAX_ATTEMPTS` times before giving up (§4.6: the
    /// master's liveness timer reclaims the task if we never get through).
    async fn compute_and_report(&self, task_id: i64) {
        let solver = self.solver.clone();
        let result = tokio::task::spawn_blocking({
            let solver = solver.clone();
            move || solver.compute(task_id)
        })
        .await;

        let result = match result {
            Ok(variants) => variants,
            Err(e) => {
                error!(task_id, error = %e, "compute callback panicked");
                return;
            }
        };

        let start = std::time::Instant::now();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let elapsed_ms = start.elapsed().as_millis() as i64;
            match self
                .master
                .request(
                    {
                        let mut header = Header::new("finishCompute");
                        header.connection_id = self.connection_id();
                        header
                    },
                    Payload::FinishCompute {
                        task_id,
                        result: result.clone(),
                        time_usage_ms: elapsed_ms,
                    },
                )
                .await
            {
                Ok(resp) if resp.is_ok() => {
                    debug!(task_id, attempt, "finishCompute delivered");
                    return;
                }
                Ok(resp) => {
                    warn!(task_id, attempt, error_code = resp.header.error_code, "master rejected finishCompute");
                }
                Err(e) => {
                    warn!(task_id, attempt, error = %e, "finishCompute send failed");
                }
            }

            if attempt >= FINISH_TASK_MAX_ATTEMPTS {
                warn!(task_id, attempt, "giving up on finishCompute, master liveness timer will reclaim the task");
                return;
            }
            tokio::time::sleep(self.retry.backoff_for_attempt(attempt)).await;
        }
    }
}

/// Handles the one request kind a worker expects on its ROUTER socket:
/// `compute`. Anything else is rejected.
pub struct WorkerHandler {
    runtime: Arc<WorkerRuntime>,
}

#[async_trait]
impl Handler for WorkerHandler {
    async fn handle(&self, request: Request) -> Response {
        let header = request.header;
        match request.payload {
            Payload::Compute { task_id } => {
                let runtime = self.runtime.clone();
                tokio::spawn(async move {
                    runtime.compute_and_report(task_id).await;
                });
                Response::ok(header, Payload::Ack)
            }
            other => {
                warn!(name = %header.name, payload = ?other, "unrecognized request at worker");
                Response::error(header, 99)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_proto::Variants;
    use std::time::Duration as StdDuration;

    struct EchoSolver;
    impl Solver for EchoSolver {
        fn init_as_master(&self, _appender: &mut dyn dispatch_solver::TaskAppender) {}
        fn compute(&self, task_id: i64) -> Variants {
            Variants::single((task_id * 2).into())
        }
        fn set_result(&self, _task_id: i64, _result: &Variants, _time_usage: StdDuration) {}
    }

    #[tokio::test]
    async fn unrecognized_payload_is_rejected() {
        let master = DpeClient::connect("tcp://127.0.0.1:0", b"test", RetryConfig::default()).unwrap();
        let runtime = Arc::new(WorkerRuntime {
            solver: Arc::new(EchoSolver),
            master,
            listen_address: "tcp://127.0.0.1:0".into(),
            connection_id: AtomicI64::new(1),
            retry: RetryConfig::default(),
        });
        let handler = WorkerHandler { runtime };
        let response = handler
            .handle(Request { header: Header::new("heartbeat"), payload: Payload::Heartbeat })
            .await;
        assert!(!response.is_ok());
    }
}
