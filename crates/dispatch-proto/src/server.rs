//! ROUTER-socket server loop shared by the master and the remote-shell
//! listener/executor endpoints.
//!
//! A bound ROUTER socket accepts requests from any number of peers
//! identified by their ZMQ identity frame; each request is handed to a
//! `Handler` and the reply routed back to the same identity.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::envelope::{Request, Response};
use crate::frame::DpeFrame;
use crate::socket_config::{create_router_and_bind, Multipart, RouterSocket, ZmqContext};

/// Implemented by whatever owns the scheduler/session state on the server
/// side of a ROUTER socket. One request in, one response out.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

pub struct DpeServer<S> {
    socket: S,
    #[allow(dead_code)]
    context: ZmqContext,
    shutdown_tx: broadcast::Sender<()>,
}

impl DpeServer<()> {
    /// Bind a ROUTER socket at `endpoint` and return a server ready to `run`.
    pub fn bind(endpoint: &str) -> Result<DpeServer<impl RouterSocket>> {
        let context = ZmqContext::new();
        let socket = create_router_and_bind(&context, endpoint)
            .with_context(|| format!("failed to bind router socket to {endpoint}"))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(DpeServer { socket, context, shutdown_tx })
    }
}

impl<S: RouterSocket> DpeServer<S> {
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub async fn run<H: Handler>(mut self, handler: Arc<H>) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                incoming = self.socket.next() => {
                    match incoming {
                        Some(Ok(multipart)) => {
                            if let Err(e) = self.handle_multipart(multipart, &handler).await {
                                error!(error = %e, "failed to handle request");
                            }
                        }
                        Some(Err(e)) => warn!(error = %e, "router socket error"),
                        None => {
                            warn!("router socket stream ended");
                            break;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("server shutdown signal received");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_multipart<H: Handler>(
        &mut self,
        multipart: Multipart,
        handler: &Arc<H>,
    ) -> Result<()> {
        let frames: Vec<Bytes> = multipart.into_iter().map(|m| Bytes::from(m.to_vec())).collect();
        let (identity, frame) = DpeFrame::from_frames_with_identity(&frames)
            .context("failed to parse request frame")?;
        let request: Request = frame.payload().context("failed to decode request payload")?;

        debug!(name = %request.header.name, request_id = request.header.request_id, "handling request");
        let response = handler.handle(request).await;

        let reply_frame = DpeFrame::response(&response).context("failed to encode response")?;
        let reply_frames = reply_frame.to_frames_with_identity(&identity);
        let multipart: Multipart = reply_frames.iter().map(|f| f.to_vec()).collect::<Vec<_>>().into();
        self.socket.send(multipart).await.context("failed to send response")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Header, Payload};

    struct EchoHandler;

    #[async_trait]
    impl Handler for EchoHandler {
        async fn handle(&self, request: Request) -> Response {
            Response {
                header: Header {
                    request_id: request.header.request_id,
                    ..request.header
                },
                payload: Payload::Ack,
            }
        }
    }

    #[tokio::test]
    async fn echo_handler_acks() {
        let request = Request {
            header: Header::new("heartbeat"),
            payload: Payload::Heartbeat,
        };
        let handler = EchoHandler;
        let response = handler.handle(request.clone()).await;
        assert_eq!(response.header.request_id, request.header.request_id);
        assert!(matches!(response.payload, Payload::Ack));
    }
}
