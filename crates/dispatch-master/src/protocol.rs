//! ROUTER-side request demux for the master.
//!
//! A worker's `connect` is the one request that can't be answered from
//! local state alone: the master must dial the worker back on the address
//! it was just given and complete a nested handshake before it can hand
//! out a connection id, since dispatch later depends on that outbound
//! client already existing. Every other request is a quick, possibly
//! fire-and-forget, round trip to the scheduler's control task.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use dispatch_proto::{DpeClient, Handler, Header, Payload, Request, Response, RetryConfig};

use crate::node_proxy::NodeProxy;
use crate::scheduler::SchedulerCommand;

pub struct MasterHandler {
    cmd_tx: mpsc::Sender<SchedulerCommand>,
    next_connection_id: AtomicI64,
    /// This master's own listen address, handed to a worker so its
    /// outbound connection back to us can be addressed symmetrically.
    local_address: String,
    retry: RetryConfig,
}

impl MasterHandler {
    pub fn new(cmd_tx: mpsc::Sender<SchedulerCommand>, local_address: String, retry: RetryConfig) -> Self {
        Self {
            cmd_tx,
            next_connection_id: AtomicI64::new(1),
            local_address,
            retry,
        }
    }

    async fn handle_connect(&self, header: &Header, address: String) -> Response {
        let identity = format!("master-to-{address}");
        let client = match DpeClient::connect(&address, identity.as_bytes(), self.retry.clone()) {
            Ok(client) => client,
            Err(e) => {
                warn!(%address, error = %e, "failed to dial back announcing worker");
                return Response::error(header.clone(), 1);
            }
        };

        let node_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let proxy = NodeProxy::new(node_id, address.clone(), self.local_address.clone(), client);

        if !proxy.connect().await {
            warn!(%address, "worker did not complete the connect handshake");
            return Response::error(header.clone(), 2);
        }

        if self.cmd_tx.send(SchedulerCommand::NodeAvailable { proxy }).await.is_err() {
            warn!("scheduler command channel closed while registering node");
            return Response::error(header.clone(), 3);
        }

        info!(node_id, %address, "worker connected");
        Response::ok(header.clone(), Payload::ConnectAck { connection_id: node_id })
    }

    /// Tears down the node claiming `header.connection_id`, but only once
    /// the scheduler confirms `address` matches what it has on record for
    /// that id — otherwise any peer that guessed or enumerated a live
    /// `connection_id` could deregister someone else's node.
    async fn handle_disconnect(&self, header: &Header, address: String) -> Response {
        let node_id = header.connection_id;
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SchedulerCommand::NodeUnavailable { node_id, address, reply: reply_tx })
            .await
            .is_err()
        {
            return Response::error(header.clone(), 3);
        }

        match reply_rx.await {
            Ok(true) => Response::ok(header.clone(), Payload::Ack),
            Ok(false) => {
                warn!(connection_id = node_id, "disconnect rejected: connection_id/address mismatch");
                Response::error(header.clone(), 5)
            }
            Err(_) => Response::error(header.clone(), 3),
        }
    }

    async fn handle_heartbeat(&self, header: &Header) -> Response {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(SchedulerCommand::Heartbeat { node_id: header.connection_id, reply: reply_tx })
            .await
            .is_err()
        {
            return Response::error(header.clone(), 3);
        }

        match reply_rx.await {
            Ok(true) => Response::ok(header.clone(), Payload::Ack),
            Ok(false) => {
                warn!(connection_id = header.connection_id, "heartbeat from unknown node");
                Response::error(header.clone(), 4)
            }
            Err(_) => Response::error(header.clone(), 3),
        }
    }

    /// Delivers a finished task to the scheduler, but only after confirming
    /// `header.connection_id` matches whichever node the registry currently
    /// has `task_id` assigned to — otherwise any connected peer that knows a
    /// live `task_id` could complete another node's task. A task with no
    /// current owner (a stale duplicate, per §7) is let through unchanged;
    /// `handle_finish_compute` in the scheduler already ignores those.
    async fn handle_finish_compute(
        &self,
        header: &Header,
        task_id: i64,
        result: dispatch_proto::Variants,
        time_usage_ms: i64,
    ) -> Response {
        let (owner_tx, owner_rx) = oneshot::channel();
        if self.cmd_tx.send(SchedulerCommand::FindTaskOwner { task_id, reply: owner_tx }).await.is_err() {
            return Response::error(header.clone(), 3);
        }
        match owner_rx.await {
            Ok(Some(owner_id)) if owner_id != header.connection_id => {
                warn!(
                    connection_id = header.connection_id,
                    task_id, owner_id, "finishCompute connection_id does not own this task, rejecting"
                );
                return Response::error(header.clone(), 5);
            }
            Ok(_) => {}
            Err(_) => return Response::error(header.clone(), 3),
        }

        let sent = self
            .cmd_tx
            .send(SchedulerCommand::FinishCompute { task_id, result, time_usage_ms })
            .await;
        if sent.is_err() {
            return Response::error(header.clone(), 3);
        }
        Response::ok(header.clone(), Payload::Ack)
    }
}

#[async_trait]
impl Handler for MasterHandler {
    async fn handle(&self, request: Request) -> Response {
        let header = request.header;
        match request.payload {
            Payload::Connect { address } => self.handle_connect(&header, address).await,
            Payload::Disconnect { address } => self.handle_disconnect(&header, address).await,
            Payload::Heartbeat => self.handle_heartbeat(&header).await,
            Payload::FinishCompute { task_id, result, time_usage_ms } => {
                self.handle_finish_compute(&header, task_id, result, time_usage_ms).await
            }
            other => {
                warn!(name = %header.name, payload = ?other, "unrecognized request at master");
                Response::error(header, 99)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerCommand;

    #[tokio::test]
    async fn disconnect_sends_node_unavailable() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let handler = MasterHandler::new(cmd_tx, "tcp://127.0.0.1:3310".into(), RetryConfig::default());

        let mut header = Header::new("disconnect");
        header.connection_id = 7;
        let handle = tokio::spawn(async move {
            handler
                .handle(Request { header, payload: Payload::Disconnect { address: "tcp://127.0.0.1:3320".into() } })
                .await
        });

        match cmd_rx.recv().await {
            Some(SchedulerCommand::NodeUnavailable { node_id, address, reply }) => {
                assert_eq!(node_id, 7);
                assert_eq!(address, "tcp://127.0.0.1:3320");
                let _ = reply.send(true);
            }
            other => panic!("unexpected command: {:?}", matches!(other, Some(_))),
        }

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn disconnect_rejected_when_address_does_not_match_registry() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let handler = MasterHandler::new(cmd_tx, "tcp://127.0.0.1:3310".into(), RetryConfig::default());

        let mut header = Header::new("disconnect");
        header.connection_id = 7;
        let handle = tokio::spawn(async move {
            handler
                .handle(Request { header, payload: Payload::Disconnect { address: "tcp://127.0.0.1:9999".into() } })
                .await
        });

        match cmd_rx.recv().await {
            Some(SchedulerCommand::NodeUnavailable { reply, .. }) => {
                let _ = reply.send(false);
            }
            other => panic!("unexpected command: {:?}", matches!(other, Some(_))),
        }

        assert!(!handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn finish_compute_rejected_when_connection_id_does_not_own_task() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let handler = MasterHandler::new(cmd_tx, "tcp://127.0.0.1:3310".into(), RetryConfig::default());

        let mut header = Header::new("finish_compute");
        header.connection_id = 2;
        let handle = tokio::spawn(async move {
            handler
                .handle(Request {
                    header,
                    payload: Payload::FinishCompute {
                        task_id: 5,
                        result: dispatch_proto::Variants::single(1i64.into()),
                        time_usage_ms: 10,
                    },
                })
                .await
        });

        match cmd_rx.recv().await {
            Some(SchedulerCommand::FindTaskOwner { task_id, reply }) => {
                assert_eq!(task_id, 5);
                let _ = reply.send(Some(1));
            }
            other => panic!("unexpected command: {:?}", matches!(other, Some(_))),
        }

        assert!(!handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn finish_compute_accepted_when_connection_id_owns_task() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let handler = MasterHandler::new(cmd_tx, "tcp://127.0.0.1:3310".into(), RetryConfig::default());

        let mut header = Header::new("finish_compute");
        header.connection_id = 1;
        let handle = tokio::spawn(async move {
            handler
                .handle(Request {
                    header,
                    payload: Payload::FinishCompute {
                        task_id: 5,
                        result: dispatch_proto::Variants::single(1i64.into()),
                        time_usage_ms: 10,
                    },
                })
                .await
        });

        match cmd_rx.recv().await {
            Some(SchedulerCommand::FindTaskOwner { reply, .. }) => {
                let _ = reply.send(Some(1));
            }
            other => panic!("unexpected command: {:?}", matches!(other, Some(_))),
        }
        match cmd_rx.recv().await {
            Some(SchedulerCommand::FinishCompute { task_id, .. }) => assert_eq!(task_id, 5),
            other => panic!("unexpected command: {:?}", matches!(other, Some(_))),
        }

        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_node_is_an_error_response() {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let handler = MasterHandler::new(cmd_tx, "tcp://127.0.0.1:3310".into(), RetryConfig::default());

        let responder = tokio::spawn(async move {
            if let Some(SchedulerCommand::Heartbeat { reply, .. }) = cmd_rx.recv().await {
                let _ = reply.send(false);
            }
        });

        let mut header = Header::new("heartbeat");
        header.connection_id = 123;
        let response = handler.handle(Request { header, payload: Payload::Heartbeat }).await;
        responder.await.unwrap();

        assert!(!response.is_ok());
    }

    #[tokio::test]
    async fn unrecognized_payload_is_rejected() {
        let (cmd_tx, _cmd_rx) = mpsc::channel(8);
        let handler = MasterHandler::new(cmd_tx, "tcp://127.0.0.1:3310".into(), RetryConfig::default());

        let response = handler
            .handle(Request { header: Header::new("create_session"), payload: Payload::CreateSession { address: "x".into() } })
            .await;

        assert!(!response.is_ok());
    }
}
