//! Ordered node registry.
//!
//! Grounded on `hootenanny::zmq::client_tracker::ClientTracker`'s
//! connection-tracking shape, but generalized from an unordered
//! `HashMap` to an insertion-order-preserving `Vec`: the scheduler's
//! tie-break (oldest idle worker first) depends on registry order, and
//! the original C++ scheduler itself walks a plain `std::vector`, so a
//! linear scan over a small `Vec` is the faithful shape here rather than
//! reaching for `indexmap` (unused anywhere else in this workspace).
//!
//! Owned exclusively by the scheduler's control task — never behind an
//! `Arc<Mutex<_>>` — so every method here takes `&mut self`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::node_proxy::NodeProxy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    Computing,
}

pub struct NodeContext {
    pub proxy: Arc<NodeProxy>,
    pub status: NodeStatus,
    pub current_task_id: Option<i64>,
    pub last_update: Instant,
}

impl NodeContext {
    pub fn new(proxy: Arc<NodeProxy>) -> Self {
        Self { proxy, status: NodeStatus::Ready, current_task_id: None, last_update: Instant::now() }
    }
}

#[derive(Default)]
pub struct NodeRegistry {
    nodes: Vec<NodeContext>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, ctx: NodeContext) {
        info!(node_id = ctx.proxy.node_id, address = %ctx.proxy.address, "node registered");
        self.nodes.push(ctx);
    }

    pub fn find_mut(&mut self, id: i64) -> Option<&mut NodeContext> {
        self.nodes.iter_mut().find(|c| c.proxy.node_id == id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeContext> {
        self.nodes.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeContext> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Removes the node with `id`, if present. If `notify_removed`, fires
    /// the peer's `disconnect` (best-effort, spawned so removal itself
    /// never blocks on a dying peer). If the removed node was `Computing`,
    /// its task is reclaimed to the **front** of `pending_queue` — LIFO for
    /// failures, so retry latency is bounded instead of the task waiting
    /// behind every task that was never tried. Returns the reclaimed
    /// `task_id`, if any, so callers can record it in the journal.
    pub fn remove_by_id(&mut self, id: i64, notify_removed: bool, pending_queue: &mut VecDeque<i64>) -> Option<i64> {
        let Some(idx) = self.nodes.iter().position(|c| c.proxy.node_id == id) else {
            return None;
        };
        let removed = self.nodes.remove(idx);

        if notify_removed {
            let proxy = removed.proxy.clone();
            tokio::spawn(async move {
                proxy.disconnect().await;
            });
        }

        if removed.status == NodeStatus::Computing {
            if let Some(task_id) = removed.current_task_id {
                warn!(node_id = id, task_id, "reclaiming task from removed node to front of queue");
                pending_queue.push_front(task_id);
                return Some(task_id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_proto::{DpeClient, RetryConfig};

    fn fake_proxy(node_id: i64) -> Arc<NodeProxy> {
        // A client that never actually connects out; fine for registry
        // bookkeeping tests which never call add_task/disconnect over the wire.
        let client = DpeClient::connect("tcp://127.0.0.1:0", b"test", RetryConfig::default())
            .expect("dealer socket setup should not require a live peer");
        NodeProxy::new(node_id, "tcp://127.0.0.1:0".into(), "tcp://127.0.0.1:1".into(), client)
    }

    #[tokio::test]
    async fn add_preserves_insertion_order() {
        let mut registry = NodeRegistry::new();
        registry.add(NodeContext::new(fake_proxy(1)));
        registry.add(NodeContext::new(fake_proxy(2)));
        registry.add(NodeContext::new(fake_proxy(3)));
        let ids: Vec<i64> = registry.iter().map(|c| c.proxy.node_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn remove_reclaims_computing_task_to_front() {
        let mut registry = NodeRegistry::new();
        let mut ctx = NodeContext::new(fake_proxy(1));
        ctx.status = NodeStatus::Computing;
        ctx.current_task_id = Some(42);
        registry.add(ctx);

        let mut pending = VecDeque::from(vec![7, 8]);
        registry.remove_by_id(1, false, &mut pending);

        assert_eq!(pending.front(), Some(&42));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn remove_unknown_id_is_a_no_op() {
        let mut registry = NodeRegistry::new();
        registry.add(NodeContext::new(fake_proxy(1)));
        let mut pending = VecDeque::new();
        registry.remove_by_id(99, false, &mut pending);
        assert_eq!(registry.len(), 1);
    }
}
