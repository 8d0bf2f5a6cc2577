//! Remote-shell session: a Listener that spawns per-client Executors on
//! demand, and the parser the interactive local client uses to split
//! command lines into tokens.
//!
//! The interactive `Client` itself lives in `main.rs` rather than here: it
//! owns a `rustyline::DefaultEditor` and the process's stdout, which makes
//! it a binary-only concern.

pub mod listener;
pub mod parser;
pub mod session;

pub use listener::{find_free_port, Listener};
pub use session::{Executor, Session};
