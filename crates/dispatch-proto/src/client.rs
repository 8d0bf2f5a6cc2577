//! DEALER-socket reactor client following the Lazy Pirate pattern.
//!
//! The socket is owned by a single dedicated task; callers talk to it
//! through an `mpsc` channel and get their reply back through a `oneshot`,
//! correlated by `Header::request_id`. This avoids lock contention on the
//! socket and keeps retry/backoff logic entirely in the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::envelope::{Header, Payload, Request, Response};
use crate::frame::DpeFrame;
use crate::retry::{HealthTracker, RetryConfig};
use crate::socket_config::{create_dealer_and_connect, DealerSocket, Multipart, ZmqContext};

enum ReactorCommand {
    Send {
        frames: Vec<Bytes>,
        request_id: i64,
        deadline: Instant,
        reply_tx: oneshot::Sender<Result<Response>>,
    },
    Shutdown,
}

struct Pending {
    reply_tx: oneshot::Sender<Result<Response>>,
    deadline: Instant,
}

async fn reactor_task<S: DealerSocket>(
    mut socket: S,
    mut cmd_rx: mpsc::Receiver<ReactorCommand>,
    health: Arc<HealthTracker>,
    name: String,
) {
    let mut pending: HashMap<i64, Pending> = HashMap::new();
    let mut cleanup = tokio::time::interval(Duration::from_secs(1));
    cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    debug!(%name, "reactor task started");

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ReactorCommand::Send { frames, request_id, deadline, reply_tx }) => {
                        let multipart: Multipart = frames.iter().map(|f| f.to_vec()).collect::<Vec<_>>().into();
                        if let Err(e) = socket.send(multipart).await {
                            let _ = reply_tx.send(Err(anyhow!("send failed: {e}")));
                            continue;
                        }
                        pending.insert(request_id, Pending { reply_tx, deadline });
                    }
                    Some(ReactorCommand::Shutdown) | None => {
                        for (_, p) in pending.drain() {
                            let _ = p.reply_tx.send(Err(anyhow!("reactor shutting down")));
                        }
                        break;
                    }
                }
            }

            incoming = socket.next() => {
                match incoming {
                    Some(Ok(multipart)) => {
                        let frames: Vec<Bytes> = multipart.into_iter().map(|m| Bytes::from(m.to_vec())).collect();
                        match DpeFrame::from_frames(&frames) {
                            Ok(frame) => match frame.payload::<Response>() {
                                Ok(response) => {
                                    trace!(request_id = response.header.request_id, "received response");
                                    if let Some(p) = pending.remove(&response.header.request_id) {
                                        health.record_success().await;
                                        let _ = p.reply_tx.send(Ok(response));
                                    } else {
                                        debug!(request_id = response.header.request_id, "discarding orphan response");
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to decode response payload"),
                            },
                            Err(e) => warn!(error = %e, "failed to parse frame"),
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "socket receive error"),
                    None => {
                        warn!("socket stream ended");
                        break;
                    }
                }
            }

            _ = cleanup.tick() => {
                let now = Instant::now();
                let expired: Vec<i64> = pending.iter().filter(|(_, p)| now > p.deadline).map(|(id, _)| *id).collect();
                for id in expired {
                    if let Some(p) = pending.remove(&id) {
                        let _ = p.reply_tx.send(Err(anyhow!("request {id} timed out")));
                    }
                }
            }
        }
    }
}

/// Reliable request/response client over a DEALER socket.
pub struct DpeClient {
    endpoint: String,
    cmd_tx: mpsc::Sender<ReactorCommand>,
    retry: RetryConfig,
    next_request_id: AtomicI64,
    pub health: Arc<HealthTracker>,
    #[allow(dead_code)]
    context: ZmqContext,
}

impl DpeClient {
    pub fn connect(endpoint: &str, identity: &[u8], retry: RetryConfig) -> Result<Arc<Self>> {
        let context = ZmqContext::new();
        let socket = create_dealer_and_connect(&context, endpoint, identity)
            .with_context(|| format!("failed to set up dealer socket to {endpoint}"))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let health = Arc::new(HealthTracker::new());

        let reactor_health = health.clone();
        let name = endpoint.to_string();
        tokio::spawn(async move {
            reactor_task(socket, cmd_rx, reactor_health, name).await;
        });

        Ok(Arc::new(Self {
            endpoint: endpoint.to_string(),
            cmd_tx,
            retry,
            next_request_id: AtomicI64::new(1),
            health,
            context,
        }))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn allocate_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send `payload` with the given header, retrying on timeout/send failure
    /// up to `retry.max_retries` times with exponential backoff.
    pub async fn request(&self, mut header: Header, payload: Payload) -> Result<Response> {
        let max_attempts = self.retry.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            header.request_id = self.allocate_request_id();

            let request = Request {
                header: header.clone(),
                payload: payload.clone(),
            };
            let frame = DpeFrame::request(&request).context("failed to encode request")?;
            let frames = frame.to_frames();

            match self.send_once(frames, header.request_id).await {
                Ok(response) => return Ok(response),
                Err(e) if attempt < max_attempts => {
                    self.health.record_failure();
                    warn!(attempt, %e, "request failed, retrying");
                    tokio::time::sleep(self.retry.backoff_for_attempt(attempt)).await;
                }
                Err(e) => {
                    self.health.record_failure();
                    return Err(e.context(format!("request failed after {attempt} attempts")));
                }
            }
        }
    }

    async fn send_once(&self, frames: Vec<Bytes>, request_id: i64) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let deadline = Instant::now() + self.retry.timeout;

        self.cmd_tx
            .send(ReactorCommand::Send { frames, request_id, deadline, reply_tx })
            .await
            .map_err(|_| anyhow!("reactor channel closed"))?;

        reply_rx.await.map_err(|_| anyhow!("reactor dropped reply channel"))?
    }

    pub async fn heartbeat(&self, connection_id: i64) -> Result<()> {
        let header = Header { connection_id, ..Header::new("heartbeat") };
        self.request(header, Payload::Heartbeat).await?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ReactorCommand::Shutdown).await;
    }
}

/// Periodically heartbeats a client and marks the peer dead after
/// `max_failures` consecutive misses, following zguide's Paranoid Pirate
/// pattern: only count failures once a connection has been seen at least once.
pub fn spawn_heartbeat_task(
    client: Arc<DpeClient>,
    connection_id: i64,
    interval: Duration,
    max_failures: u32,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut ever_connected = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match client.heartbeat(connection_id).await {
                        Ok(()) => {
                            ever_connected = true;
                        }
                        Err(e) => {
                            if ever_connected {
                                let failures = client.health.record_failure();
                                if failures >= max_failures {
                                    client.health.set_state(crate::retry::ConnectionState::Dead);
                                    warn!(%e, failures, "peer marked dead");
                                }
                            }
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
    });
}
