//! `Request`/`Response` envelopes and the `Payload` oneof exchanged between
//! master, workers, and remote-shell peers.
//!
//! Every message on the wire carries the same common fields regardless of
//! which `Payload` variant it wraps; `connection_id` is the dedup/routing key
//! a peer uses to find the right session object, `request_id` is a per-proxy
//! monotonic counter used to correlate replies.

use serde::{Deserialize, Serialize};

use crate::variants::Variants;

/// Fields present on every `Request` and `Response`, mirroring the
/// `{connection_id, request_id, timestamp, session_id, error_code, name}`
/// common-field set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub connection_id: i64,
    pub request_id: i64,
    pub timestamp: i64,
    pub session_id: i64,
    pub error_code: i32,
    pub name: String,
}

impl Header {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// The oneof payload carried by a `Request` or `Response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// Worker -> master: register this worker's callback address.
    Connect { address: String },
    /// Worker -> master: explicit departure.
    Disconnect { address: String },
    /// Liveness ping, no data.
    Heartbeat,
    /// Master -> worker: run this task.
    Compute { task_id: i64 },
    /// Worker -> master: task result.
    FinishCompute {
        task_id: i64,
        result: Variants,
        time_usage_ms: i64,
    },

    /// Remote-shell: local client -> listener.
    CreateSession { address: String },
    /// Remote-shell: local client -> executor, teardown.
    DeleteSession,
    /// Remote-shell: local client -> executor, run a command.
    ExecuteCommand {
        address: String,
        cmd: String,
        args: Vec<String>,
    },
    /// Remote-shell: executor -> local client, streamed output.
    ExecuteOutput {
        original_request_id: i64,
        output: String,
        is_exit: bool,
        exit_code: i32,
    },
    /// Remote-shell: file push/pull, `cmd` is "fs" or "fg".
    FileOperation { cmd: String, args: Vec<FileArg> },
    /// Remote-shell: session-scoped heartbeat (distinct from worker Heartbeat).
    SessionHeartBeat,

    /// A reply carrying only the connection id allocated on `connect`.
    ConnectAck { connection_id: i64 },
    /// A reply carrying the session id allocated on `create_session`, plus
    /// the address of the spawned per-session executor.
    SessionAck { session_id: i64, address: String },
    /// A generic empty acknowledgement (disconnect, heartbeat, finishCompute).
    Ack,
}

/// One argument of a `FileOperation`: either a path (request) or a path
/// paired with file bytes (request body / response body), matching the
/// original's alternating `(path, bytes)` argument convention but typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FileArg {
    Path(String),
    PathAndBytes(String, #[serde(with = "serde_bytes")] Vec<u8>),
}

/// A full request: header + payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(flatten)]
    pub header: Header,
    pub payload: Payload,
}

/// A full response: header (with `error_code` set on failure) + payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(flatten)]
    pub header: Header,
    pub payload: Payload,
}

impl Response {
    pub fn ok(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    pub fn error(mut header: Header, error_code: i32) -> Self {
        header.error_code = error_code;
        Self {
            header,
            payload: Payload::Ack,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.header.error_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips_through_json() {
        let req = Request {
            header: Header::new("connect"),
            payload: Payload::Connect {
                address: "tcp://127.0.0.1:4100".into(),
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(req, parsed);
    }

    #[test]
    fn response_error_sets_code() {
        let header = Header::new("compute");
        let resp = Response::error(header, 7);
        assert!(!resp.is_ok());
        assert_eq!(resp.header.error_code, 7);
    }

    #[test]
    fn file_operation_roundtrip() {
        let req = Request {
            header: Header::new("file_operation"),
            payload: Payload::FileOperation {
                cmd: "fs".into(),
                args: vec![FileArg::PathAndBytes("foo.txt".into(), vec![1, 2, 3])],
            },
        };
        let bytes = rmp_serde::to_vec(&req).unwrap();
        let parsed: Request = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(req, parsed);
    }
}
