//! `DPE01` wire framing.
//!
//! A frame is three ZMQ multipart frames (plus whatever identity frames a
//! ROUTER socket prepends): a magic marker, a 2-byte big-endian command tag,
//! and a msgpack-encoded body. Unlike `hooteproto`'s 7-frame `HOOT01` layout
//! this carries no separate service/traceparent/request-id frames — those
//! fields already live inside the envelope's `Header`, so one body frame is
//! enough.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

pub const PROTOCOL_VERSION: &[u8] = b"DPE01";
const FRAME_COUNT: usize = 3;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Request = 0x0001,
    Response = 0x0002,
}

impl Command {
    pub fn from_u16(value: u16) -> Result<Self, FrameError> {
        match value {
            0x0001 => Ok(Command::Request),
            0x0002 => Ok(Command::Response),
            other => Err(FrameError::InvalidCommand(other)),
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("missing DPE01 magic marker")]
    InvalidProtocol,
    #[error("frame truncated: expected at least {expected} frames, got {actual}")]
    MissingFrame { expected: usize, actual: usize },
    #[error("invalid command tag: {0:#06x}")]
    InvalidCommand(u16),
    #[error("command frame too short: expected 2 bytes, got {0}")]
    CommandFrameTooShort(usize),
    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

/// A parsed `DPE01` multipart message.
#[derive(Debug, Clone)]
pub struct DpeFrame {
    pub command: Command,
    pub body: Bytes,
}

impl DpeFrame {
    pub fn request<T: Serialize>(payload: &T) -> Result<Self, FrameError> {
        Ok(Self {
            command: Command::Request,
            body: Bytes::from(rmp_serde::to_vec(payload)?),
        })
    }

    pub fn response<T: Serialize>(payload: &T) -> Result<Self, FrameError> {
        Ok(Self {
            command: Command::Response,
            body: Bytes::from(rmp_serde::to_vec(payload)?),
        })
    }

    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(rmp_serde::from_slice(&self.body)?)
    }

    /// Serialize to `[DPE01, command, body]`.
    pub fn to_frames(&self) -> Vec<Bytes> {
        let mut frames = Vec::with_capacity(FRAME_COUNT);
        frames.push(Bytes::from_static(PROTOCOL_VERSION));
        let mut cmd_buf = BytesMut::with_capacity(2);
        cmd_buf.put_u16(self.command.to_u16());
        frames.push(cmd_buf.freeze());
        frames.push(self.body.clone());
        frames
    }

    /// Serialize with a ROUTER identity prefix prepended.
    pub fn to_frames_with_identity(&self, identity: &[Bytes]) -> Vec<Bytes> {
        let mut frames = identity.to_vec();
        frames.extend(self.to_frames());
        frames
    }

    /// Parse frames, scanning for the `DPE01` marker so identity frames
    /// prepended by a ROUTER socket don't have to be stripped by the caller.
    pub fn from_frames(frames: &[Bytes]) -> Result<Self, FrameError> {
        let (_, frame) = Self::from_frames_with_identity(frames)?;
        Ok(frame)
    }

    pub fn from_frames_with_identity(
        frames: &[Bytes],
    ) -> Result<(Vec<Bytes>, Self), FrameError> {
        let proto_idx = frames
            .iter()
            .position(|f| f.as_ref() == PROTOCOL_VERSION)
            .ok_or(FrameError::InvalidProtocol)?;
        let identity = frames[..proto_idx].to_vec();

        let rest = &frames[proto_idx..];
        if rest.len() < FRAME_COUNT {
            return Err(FrameError::MissingFrame {
                expected: FRAME_COUNT,
                actual: rest.len(),
            });
        }

        let cmd_frame = &rest[1];
        if cmd_frame.len() < 2 {
            return Err(FrameError::CommandFrameTooShort(cmd_frame.len()));
        }
        let command = Command::from_u16(u16::from_be_bytes([cmd_frame[0], cmd_frame[1]]))?;
        let body = rest[2].clone();

        Ok((identity, Self { command, body }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Header, Payload, Request};

    #[test]
    fn request_roundtrip() {
        let req = Request {
            header: Header::new("heartbeat"),
            payload: Payload::Heartbeat,
        };
        let frame = DpeFrame::request(&req).unwrap();
        let frames = frame.to_frames();
        assert_eq!(frames.len(), FRAME_COUNT);
        assert_eq!(frames[0].as_ref(), PROTOCOL_VERSION);

        let parsed = DpeFrame::from_frames(&frames).unwrap();
        assert_eq!(parsed.command, Command::Request);
        let recovered: Request = parsed.payload().unwrap();
        assert_eq!(recovered, req);
    }

    #[test]
    fn identity_prefix_is_preserved() {
        let req = Request {
            header: Header::new("compute"),
            payload: Payload::Compute { task_id: 3 },
        };
        let frame = DpeFrame::request(&req).unwrap();
        let identity = vec![Bytes::from_static(b"\x00\x01worker-7")];
        let framed = frame.to_frames_with_identity(&identity);

        let (recovered_identity, parsed) = DpeFrame::from_frames_with_identity(&framed).unwrap();
        assert_eq!(recovered_identity, identity);
        assert_eq!(parsed.command, Command::Request);
    }

    #[test]
    fn missing_magic_is_rejected() {
        let frames = vec![Bytes::from_static(b"garbage")];
        assert!(matches!(
            DpeFrame::from_frames(&frames),
            Err(FrameError::InvalidProtocol)
        ));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let frames = vec![Bytes::from_static(PROTOCOL_VERSION), Bytes::from_static(b"\x00\x01")];
        assert!(matches!(
            DpeFrame::from_frames(&frames),
            Err(FrameError::MissingFrame { .. })
        ));
    }
}
