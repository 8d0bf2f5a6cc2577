//! Wire protocol and transport for the dispatch compute framework.
//!
//! `variants` and `envelope` define the message shapes; `frame` defines how
//! they're packed onto a ZMQ multipart. `client`/`server`/`retry`/
//! `socket_config` (gated behind the `peer` feature) provide the actual
//! DEALER/ROUTER reactor plumbing used by `dispatch-master`,
//! `dispatch-worker`, and `dispatch-shell`.

pub mod envelope;
pub mod frame;
pub mod variants;

#[cfg(feature = "peer")]
pub mod client;
#[cfg(feature = "peer")]
pub mod retry;
#[cfg(feature = "peer")]
pub mod server;
#[cfg(feature = "peer")]
pub mod socket_config;

pub use envelope::{FileArg, Header, Payload, Request, Response};
pub use frame::{Command, DpeFrame, FrameError};
pub use variants::{VariantItem, Variants};

#[cfg(feature = "peer")]
pub use client::DpeClient;
#[cfg(feature = "peer")]
pub use retry::RetryConfig;
#[cfg(feature = "peer")]
pub use server::{DpeServer, Handler};
