//! Master-side handle to a connected worker.
//!
//! A `NodeProxy` owns an outbound `DpeClient` dialing the worker's own
//! listen address. Dispatched requests (`compute`, `finish_compute`) are
//! stamped with the worker-assigned `remote_connection_id` recorded during
//! `connect`. The registry holds the strong `Arc`; dispatch completions
//! capture a `Weak` and upgrade before delivering a result, becoming a
//! silent no-op if the node was removed in the meantime (§4.2's guard
//! against use-after-release).

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

use dispatch_proto::{DpeClient, Header, Payload, Variants};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Closed = 3,
}

impl NodeState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeState::Connecting,
            2 => NodeState::Ready,
            3 => NodeState::Closed,
            _ => NodeState::Disconnected,
        }
    }
}

pub struct NodeProxy {
    /// Master-assigned registry key, handed to the worker as `connection_id`
    /// on its own requests back to us.
    pub node_id: i64,
    /// The worker's own listen address, dialed for outbound dispatch.
    pub address: String,
    local_address: String,
    client: Arc<DpeClient>,
    remote_connection_id: AtomicI64,
    state: AtomicU8,
}

impl NodeProxy {
    pub fn new(node_id: i64, address: String, local_address: String, client: Arc<DpeClient>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            address,
            local_address,
            client,
            remote_connection_id: AtomicI64::new(0),
            state: AtomicU8::new(NodeState::Disconnected as u8),
        })
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: NodeState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Sends a `connect` request carrying our own listen address; on a
    /// well-formed `ConnectAck` records the worker-assigned connection id
    /// and transitions to `Ready`. Any other outcome transitions to `Closed`.
    pub async fn connect(&self) -> bool {
        self.set_state(NodeState::Connecting);
        let header = Header::new("connect");
        let payload = Payload::Connect { address: self.local_address.clone() };

        match self.client.request(header, payload).await {
            Ok(resp) if resp.is_ok() => {
                if let Payload::ConnectAck { connection_id } = resp.payload {
                    self.remote_connection_id.store(connection_id, Ordering::Relaxed);
                    self.set_state(NodeState::Ready);
                    true
                } else {
                    self.set_state(NodeState::Closed);
                    false
                }
            }
            _ => {
                self.set_state(NodeState::Closed);
                false
            }
        }
    }

    /// Fire-and-forget departure notice. Failure is not surfaced — we're
    /// already tearing this node down.
    pub async fn disconnect(&self) {
        self.set_state(NodeState::Closed);
        let header = self.stamped_header("disconnect");
        let _ = self
            .client
            .request(header, Payload::Disconnect { address: self.local_address.clone() })
            .await;
    }

    fn stamped_header(&self, name: &str) -> Header {
        let mut header = Header::new(name);
        header.connection_id = self.remote_connection_id.load(Ordering::Relaxed);
        header.timestamp = now_millis();
        header
    }

    /// Dispatches `task_id` to the worker. Per §9's redesign note, the
    /// caller always learns both `node_id` (via `self.node_id`) and
    /// `task_id` on failure, fixing the original's positional-argument
    /// asymmetry.
    pub async fn add_task(&self, task_id: i64) -> Result<()> {
        let header = self.stamped_header("compute");
        let resp = self.client.request(header, Payload::Compute { task_id }).await?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(anyhow!("worker rejected compute dispatch, error_code={}", resp.header.error_code))
        }
    }

    /// Submits a finished task's result to whichever peer this proxy
    /// points at. Symmetric counterpart to `add_task`, usable by a worker
    /// holding a proxy to its master; `dispatch-master` never calls it
    /// since it only dispatches, never finishes, tasks.
    pub async fn finish_task(&self, task_id: i64, result: Variants, time_usage_ms: i64) -> Result<()> {
        let header = self.stamped_header("finishCompute");
        let resp = self
            .client
            .request(header, Payload::FinishCompute { task_id, result, time_usage_ms })
            .await?;
        if resp.is_ok() {
            Ok(())
        } else {
            Err(anyhow!("finishCompute rejected, error_code={}", resp.header.error_code))
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrips_through_u8() {
        for state in [NodeState::Disconnected, NodeState::Connecting, NodeState::Ready, NodeState::Closed] {
            assert_eq!(NodeState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn now_millis_is_positive() {
        assert!(now_millis() > 0);
    }
}
