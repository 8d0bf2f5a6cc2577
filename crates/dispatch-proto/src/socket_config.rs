//! Centralized ZMQ socket configuration.
//!
//! All socket setup for master/worker/shell peers goes through these
//! helpers so connection behaviour stays consistent across binaries.

use anyhow::{Context, Result};
use futures::{Sink, Stream};
use tmq::{dealer, router, TmqError};

pub use tmq::Context as ZmqContext;
pub use tmq::Multipart;

pub const DEFAULT_RECONNECT_IVL_MS: i32 = 1000;
/// Caps exponential reconnect backoff so a peer coming back after an outage
/// isn't kept waiting for hours.
pub const DEFAULT_RECONNECT_IVL_MAX_MS: i32 = 60_000;
pub const DEFAULT_HEARTBEAT_IVL_MS: i32 = 30_000;
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: i32 = 90_000;

pub trait DealerSocket:
    Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}
impl<T> DealerSocket for T where
    T: Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}

pub trait RouterSocket:
    Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}
impl<T> RouterSocket for T where
    T: Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}

/// Create a configured DEALER socket and connect to an endpoint.
pub fn create_dealer_and_connect(
    ctx: &ZmqContext,
    endpoint: &str,
    identity: &[u8],
) -> Result<impl DealerSocket> {
    dealer(ctx)
        .set_linger(0)
        .set_reconnect_ivl(DEFAULT_RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(DEFAULT_RECONNECT_IVL_MAX_MS)
        .set_identity(identity)
        .connect(endpoint)
        .with_context(|| format!("failed to connect DEALER to {endpoint}"))
}

/// Create a configured ROUTER socket and bind to an endpoint.
pub fn create_router_and_bind(ctx: &ZmqContext, endpoint: &str) -> Result<impl RouterSocket> {
    router(ctx)
        .set_linger(0)
        .set_reconnect_ivl(DEFAULT_RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(DEFAULT_RECONNECT_IVL_MAX_MS)
        .bind(endpoint)
        .with_context(|| format!("failed to bind ROUTER to {endpoint}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_timeout_tolerates_missed_beats() {
        assert!(DEFAULT_HEARTBEAT_TIMEOUT_MS >= DEFAULT_HEARTBEAT_IVL_MS * 3);
    }
}
