//! Worker runtime: the opposite end of the dispatch protocol from
//! `dispatch-master`.
//!
//! A worker dials the master, completes the `connect` handshake, then sits
//! on a bound ROUTER socket waiting for `compute` requests. Each one is run
//! through the user's [`Solver::compute`] and reported back via
//! `finishTask`, retried with backoff on transport failure and then
//! dropped — the master's liveness timer reclaims the task if the retry
//! budget is exhausted.

pub mod runtime;

pub use runtime::{WorkerHandler, WorkerRuntime};
