//! Core task-scheduling algorithm.
//!
//! Faithfully reimplements `SimpleMasterTaskScheduler::refreshStatusImpl`'s
//! step order (collect timed-out nodes, dispatch to ready nodes in registry
//! order, remove flagged nodes, check termination), with the two bugs named
//! in the design notes fixed: the dispatch callback always carries both
//! `node_id` and `task_id`, and `handleFinishCompute` returns on the first
//! matching node instead of scanning the rest of the registry.
//!
//! Runs as a single control task per §5's concurrency model: the registry
//! and pending queue are plain owned values, never `Arc<Mutex<_>>`, since
//! only this task's `tokio::select!` loop ever touches them. Other tasks
//! (the protocol handler, dispatch completions) talk to it exclusively
//! through `SchedulerCommand` messages.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};

use dispatch_proto::Variants;
use dispatch_solver::{Solver, TaskAppender};

use crate::node_proxy::NodeProxy;
use crate::persistence::{JournalEvent, Persistence, SchedulerSnapshot};
use crate::registry::{NodeContext, NodeRegistry, NodeStatus};

pub enum SchedulerCommand {
    NodeAvailable { proxy: Arc<NodeProxy> },
    /// `address` must match the registry's recorded address for `node_id`;
    /// `reply` carries whether the node was actually torn down, so the
    /// protocol handler can reject a disconnect claiming someone else's
    /// `connection_id`.
    NodeUnavailable { node_id: i64, address: String, reply: oneshot::Sender<bool> },
    Heartbeat { node_id: i64, reply: oneshot::Sender<bool> },
    /// Looks up which node, if any, is currently `Computing` `task_id` —
    /// used by the protocol handler to verify a `finishCompute` sender's
    /// `connection_id` before forwarding it, per §4.5's ownership invariant.
    FindTaskOwner { task_id: i64, reply: oneshot::Sender<Option<i64>> },
    FinishCompute { task_id: i64, result: Variants, time_usage_ms: i64 },
    DispatchResult { node_id: i64, task_id: i64, ok: bool },
    Shutdown,
}

pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub snapshot_interval: Duration,
    pub skip_load_state: bool,
    /// Node silent longer than this is flagged for removal on the next tick
    /// (§4.4 step 1).
    pub liveness_timeout: Duration,
}

/// Best-effort journal append; a failure is logged, never fatal, matching
/// the snapshot write's own error handling a few lines below.
async fn journal(persistence: &Option<Arc<Mutex<Persistence>>>, event: JournalEvent) {
    if let Some(p) = persistence {
        if let Err(e) = p.lock().await.append_journal(&event) {
            warn!(error = %e, "failed to append journal event");
        }
    }
}

struct QueueAppender<'a>(&'a mut VecDeque<i64>);

impl TaskAppender for QueueAppender<'_> {
    fn add_task(&mut self, task_id: i64) {
        self.0.push_back(task_id);
    }
}

/// Spawns the scheduler's control task, returning a command sender and a
/// receiver that fires once when the run is complete (pending queue
/// drained and no node still computing — §4.4 step 5).
pub fn spawn(
    solver: Arc<dyn Solver>,
    config: SchedulerConfig,
    persistence: Option<Arc<Mutex<Persistence>>>,
) -> (mpsc::Sender<SchedulerCommand>, broadcast::Receiver<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (exit_tx, exit_rx) = broadcast::channel(1);
    let tx_for_dispatch = cmd_tx.clone();
    tokio::spawn(run(solver, config, cmd_rx, tx_for_dispatch, persistence, exit_tx));
    (cmd_tx, exit_rx)
}

async fn run(
    solver: Arc<dyn Solver>,
    config: SchedulerConfig,
    mut cmd_rx: mpsc::Receiver<SchedulerCommand>,
    cmd_tx: mpsc::Sender<SchedulerCommand>,
    persistence: Option<Arc<Mutex<Persistence>>>,
    exit_tx: broadcast::Sender<()>,
) {
    let mut pending_queue = VecDeque::new();
    let mut results: Vec<(i64, i64)> = Vec::new();
    let mut restored = false;

    if !config.skip_load_state {
        if let Some(p) = &persistence {
            match p.lock().await.load_snapshot() {
                Ok(Some(snapshot)) => {
                    info!(
                        pending = snapshot.pending_queue.len(),
                        assigned = snapshot.assigned.len(),
                        results = snapshot.results.len(),
                        "restored scheduler state from snapshot"
                    );
                    pending_queue = snapshot.pending_queue;
                    // No node is connected yet on a cold restart; anything
                    // that was mid-flight goes back to the front of the queue.
                    for (_node_id, task_id) in snapshot.assigned.into_iter().rev() {
                        pending_queue.push_front(task_id);
                    }
                    results = snapshot.results;
                    restored = true;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to load snapshot, starting with a fresh task set"),
            }
        }
    }

    if !restored {
        let mut appender = QueueAppender(&mut pending_queue);
        solver.init_as_master(&mut appender);
    }
    info!(task_count = pending_queue.len(), restored, "scheduler starting");

    let mut nodes = NodeRegistry::new();
    let liveness_timeout = config.liveness_timeout;

    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut snapshot_ticker = tokio::time::interval(config.snapshot_interval);
    snapshot_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    warn!("all scheduler command senders dropped, shutting down");
                    break;
                };
                match cmd {
                    SchedulerCommand::NodeAvailable { proxy } => {
                        journal(&persistence, JournalEvent::NodeJoined { node_id: proxy.node_id, address: proxy.address.clone() }).await;
                        nodes.add(NodeContext::new(proxy));
                        refresh(&solver, &mut pending_queue, &mut nodes, &mut results, &cmd_tx, &exit_tx, liveness_timeout, &persistence).await;
                    }
                    SchedulerCommand::NodeUnavailable { node_id, address, reply } => {
                        let owns_address = nodes.find_mut(node_id).map(|ctx| ctx.proxy.address == address).unwrap_or(false);
                        let _ = reply.send(owns_address);
                        if owns_address {
                            if let Some(task_id) = nodes.remove_by_id(node_id, false, &mut pending_queue) {
                                journal(&persistence, JournalEvent::TaskReclaimed { node_id, task_id }).await;
                            }
                            refresh(&solver, &mut pending_queue, &mut nodes, &mut results, &cmd_tx, &exit_tx, liveness_timeout, &persistence).await;
                        } else {
                            warn!(node_id, %address, "disconnect connection_id does not match the registry's address for that node, ignoring");
                        }
                    }
                    SchedulerCommand::Heartbeat { node_id, reply } => {
                        let found = if let Some(ctx) = nodes.find_mut(node_id) {
                            ctx.last_update = Instant::now();
                            true
                        } else {
                            false
                        };
                        let _ = reply.send(found);
                    }
                    SchedulerCommand::FindTaskOwner { task_id, reply } => {
                        let owner = nodes
                            .iter()
                            .find(|ctx| ctx.status == NodeStatus::Computing && ctx.current_task_id == Some(task_id))
                            .map(|ctx| ctx.proxy.node_id);
                        let _ = reply.send(owner);
                    }
                    SchedulerCommand::FinishCompute { task_id, result, time_usage_ms } => {
                        if handle_finish_compute(&solver, &mut nodes, &mut results, task_id, result, time_usage_ms) {
                            journal(&persistence, JournalEvent::TaskDone { task_id, time_usage_ms }).await;
                        }
                        refresh(&solver, &mut pending_queue, &mut nodes, &mut results, &cmd_tx, &exit_tx, liveness_timeout, &persistence).await;
                    }
                    SchedulerCommand::DispatchResult { node_id, task_id, ok } => {
                        if !ok {
                            warn!(node_id, task_id, "dispatch failed, worker presumed unreachable");
                            if let Some(task_id) = nodes.remove_by_id(node_id, true, &mut pending_queue) {
                                journal(&persistence, JournalEvent::TaskReclaimed { node_id, task_id }).await;
                            }
                            refresh(&solver, &mut pending_queue, &mut nodes, &mut results, &cmd_tx, &exit_tx, liveness_timeout, &persistence).await;
                        }
                    }
                    SchedulerCommand::Shutdown => break,
                }
            }

            _ = ticker.tick() => {
                refresh(&solver, &mut pending_queue, &mut nodes, &mut results, &cmd_tx, &exit_tx, liveness_timeout, &persistence).await;
            }

            _ = snapshot_ticker.tick() => {
                if let Some(p) = &persistence {
                    let snapshot = build_snapshot(&pending_queue, &nodes, &results);
                    let p = p.clone();
                    match p.lock().await.save_snapshot(&snapshot) {
                        Ok(()) => debug!("snapshot saved"),
                        Err(e) => error!(error = %e, "failed to save snapshot"),
                    }
                }
            }
        }
    }
}

fn build_snapshot(pending_queue: &VecDeque<i64>, nodes: &NodeRegistry, results: &[(i64, i64)]) -> SchedulerSnapshot {
    let assigned = nodes
        .iter()
        .filter_map(|ctx| ctx.current_task_id.map(|task_id| (ctx.proxy.node_id, task_id)))
        .collect();
    SchedulerSnapshot {
        pending_queue: pending_queue.clone(),
        assigned,
        results: results.to_vec(),
    }
}

/// The tick: dispatches ready nodes, reclaims timed-out ones, and checks
/// for completion. Mirrors `refreshStatusImpl`'s single pass exactly.
async fn refresh(
    solver: &Arc<dyn Solver>,
    pending_queue: &mut VecDeque<i64>,
    nodes: &mut NodeRegistry,
    results: &mut [(i64, i64)],
    cmd_tx: &mpsc::Sender<SchedulerCommand>,
    exit_tx: &broadcast::Sender<()>,
    liveness_timeout: Duration,
    persistence: &Option<Arc<Mutex<Persistence>>>,
) {
    let _ = results; // kept parallel to dpe_master_node.h's all_result_ for snapshotting
    let now = Instant::now();
    let mut will_remove = Vec::new();
    let mut running_count = 0usize;

    for ctx in nodes.iter_mut() {
        if now.duration_since(ctx.last_update) > liveness_timeout {
            error!(node_id = ctx.proxy.node_id, "node liveness timeout, flagging for removal");
            will_remove.push(ctx.proxy.node_id);
            continue;
        }

        match ctx.status {
            NodeStatus::Ready => {
                if let Some(task_id) = pending_queue.pop_front() {
                    let node_id = ctx.proxy.node_id;
                    ctx.status = NodeStatus::Computing;
                    ctx.current_task_id = Some(task_id);
                    running_count += 1;
                    debug!(node_id, task_id, "dispatching task");
                    journal(persistence, JournalEvent::TaskAssigned { node_id, task_id }).await;
                    dispatch(ctx.proxy.clone(), node_id, task_id, cmd_tx.clone());
                }
            }
            NodeStatus::Computing => {
                running_count += 1;
            }
        }
    }

    for id in will_remove {
        if let Some(task_id) = nodes.remove_by_id(id, true, pending_queue) {
            journal(persistence, JournalEvent::TaskReclaimed { node_id: id, task_id }).await;
        }
    }

    if running_count == 0 && pending_queue.is_empty() {
        info!("pending queue drained and no node computing, finishing");
        solver.finish();
        let _ = exit_tx.send(());
    }
}

/// Spawns the actual dispatch RPC, reporting the outcome back to the
/// control task. Captures a `Weak` handle so a node removed between
/// dispatch and completion (e.g. by a concurrent liveness timeout) makes
/// this a no-op rather than a use-after-free or a stray result.
fn dispatch(proxy: Arc<NodeProxy>, node_id: i64, task_id: i64, cmd_tx: mpsc::Sender<SchedulerCommand>) {
    let weak = Arc::downgrade(&proxy);
    drop(proxy);
    tokio::spawn(async move {
        let Some(proxy) = weak.upgrade() else { return };
        let ok = proxy.add_task(task_id).await.is_ok();
        let _ = cmd_tx.send(SchedulerCommand::DispatchResult { node_id, task_id, ok }).await;
    });
}

/// Delivers a finished task's result to the solver and returns its node to
/// `Ready`. Returns on the **first** matching node — the original's
/// missing `break` meant it kept scanning every remaining node for no
/// reason once the match was found; a duplicate `finishCompute` for a task
/// no longer assigned to anyone is logged and ignored (idempotent by
/// design, §7).
fn handle_finish_compute(
    solver: &Arc<dyn Solver>,
    nodes: &mut NodeRegistry,
    results: &mut Vec<(i64, i64)>,
    task_id: i64,
    result: Variants,
    time_usage_ms: i64,
) -> bool {
    for ctx in nodes.iter_mut() {
        if ctx.status == NodeStatus::Computing && ctx.current_task_id == Some(task_id) {
            let time_usage = Duration::from_millis(time_usage_ms.max(0) as u64);
            solver.set_result(task_id, &result, time_usage);
            results.push((task_id, extract_i64(&result)));
            ctx.status = NodeStatus::Ready;
            ctx.current_task_id = None;
            return true;
        }
    }
    warn!(task_id, "finishCompute for a task not currently assigned, ignoring (duplicate delivery)");
    false
}

fn extract_i64(result: &Variants) -> i64 {
    match result.iter().next() {
        Some(dispatch_proto::VariantItem::I64(v)) => *v,
        Some(dispatch_proto::VariantItem::I32(v)) => *v as i64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch_proto::{DpeClient, RetryConfig};
    use std::sync::Mutex as StdMutex;

    struct CountingSolver {
        count: i64,
        finished: StdMutex<bool>,
    }

    impl Solver for CountingSolver {
        fn init_as_master(&self, appender: &mut dyn TaskAppender) {
            for id in 0..self.count {
                appender.add_task(id);
            }
        }
        fn compute(&self, task_id: i64) -> Variants {
            Variants::single((task_id * task_id).into())
        }
        fn set_result(&self, _task_id: i64, _result: &Variants, _time_usage: Duration) {}
        fn finish(&self) {
            *self.finished.lock().unwrap() = true;
        }
    }

    fn fake_proxy(node_id: i64) -> Arc<NodeProxy> {
        let client = DpeClient::connect("tcp://127.0.0.1:0", b"test", RetryConfig::default())
            .expect("dealer socket setup should not require a live peer");
        NodeProxy::new(node_id, "tcp://127.0.0.1:0".into(), "tcp://127.0.0.1:1".into(), client)
    }

    #[tokio::test]
    async fn empty_task_set_finishes_on_first_tick() {
        let solver = Arc::new(CountingSolver { count: 0, finished: StdMutex::new(false) });
        let config = SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            snapshot_interval: Duration::from_secs(3600),
            skip_load_state: true,
            liveness_timeout: Duration::from_secs(35),
        };
        let (_cmd_tx, mut exit_rx) = spawn(solver.clone(), config, None);
        tokio::time::timeout(Duration::from_secs(1), exit_rx.recv())
            .await
            .expect("scheduler should finish promptly")
            .unwrap();
        assert!(*solver.finished.lock().unwrap());
    }

    #[test]
    fn handle_finish_compute_returns_on_first_match_only() {
        let solver: Arc<dyn Solver> = Arc::new(CountingSolver { count: 1, finished: StdMutex::new(false) });
        let mut nodes = NodeRegistry::new();
        let mut ctx1 = NodeContext::new(fake_proxy(1));
        ctx1.status = NodeStatus::Computing;
        ctx1.current_task_id = Some(5);
        nodes.add(ctx1);
        let mut ctx2 = NodeContext::new(fake_proxy(2));
        ctx2.status = NodeStatus::Computing;
        ctx2.current_task_id = Some(5);
        nodes.add(ctx2);

        let mut results = Vec::new();
        let applied = handle_finish_compute(&solver, &mut nodes, &mut results, 5, Variants::single(25i64.into()), 1);

        assert!(applied);
        let statuses: Vec<NodeStatus> = nodes.iter().map(|c| c.status).collect();
        assert_eq!(statuses, vec![NodeStatus::Ready, NodeStatus::Computing]);
        assert_eq!(results, vec![(5, 25)]);
    }

    #[test]
    fn handle_finish_compute_ignores_unassigned_task() {
        let solver: Arc<dyn Solver> = Arc::new(CountingSolver { count: 1, finished: StdMutex::new(false) });
        let mut nodes = NodeRegistry::new();
        let mut results = Vec::new();
        let applied = handle_finish_compute(&solver, &mut nodes, &mut results, 99, Variants::single(1i64.into()), 1);
        assert!(!applied);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn find_task_owner_reports_the_assigned_node() {
        let solver = Arc::new(CountingSolver { count: 0, finished: StdMutex::new(false) });
        let config = SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            snapshot_interval: Duration::from_secs(3600),
            skip_load_state: true,
            liveness_timeout: Duration::from_secs(35),
        };
        let (cmd_tx, _exit_rx) = spawn(solver, config, None);
        cmd_tx.send(SchedulerCommand::NodeAvailable { proxy: fake_proxy(1) }).await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        cmd_tx.send(SchedulerCommand::FindTaskOwner { task_id: 123, reply: reply_tx }).await.unwrap();
        assert_eq!(reply_rx.await.unwrap(), None);
    }
}
