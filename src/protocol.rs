//! Wire protocol shared by worker and front-end connections.
//!
//! Wire format: `[kind: u8][length: u32 big-endian][payload: bytes]`
//!
//! Workers speak it over a raw TCP stream; front-ends send and receive the
//! same frames as binary WebSocket messages. Every payload is JSON. Opaque
//! byte fields inside JSON are base64-encoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::session::SessionId;

/// Command kind byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    // Worker handshake
    Register = 0x01,
    Registered = 0x02,

    // Hub -> worker, worker -> hub
    Request = 0x03,
    CancelRequest = 0x04,
    Output = 0x05,
    Done = 0x06,
    Error = 0x07,

    // Front-end -> hub
    Run = 0x08,
    Started = 0x09,
    CancelSession = 0x0A,
    CancelAction = 0x0B,

    // Hub -> every front-end
    Broadcast = 0x0C,
}

impl CommandKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Register),
            0x02 => Some(Self::Registered),
            0x03 => Some(Self::Request),
            0x04 => Some(Self::CancelRequest),
            0x05 => Some(Self::Output),
            0x06 => Some(Self::Done),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::Run),
            0x09 => Some(Self::Started),
            0x0A => Some(Self::CancelSession),
            0x0B => Some(Self::CancelAction),
            0x0C => Some(Self::Broadcast),
            _ => None,
        }
    }
}

/// Maximum frame payload size (16 MiB). Prevents OOM on malformed data.
const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// A protocol frame with a kind tag and payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: CommandKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: CommandKind, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    /// Create a frame from a serializable message.
    pub fn control<T: Serialize>(kind: CommandKind, msg: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(kind, encode_payload(msg)?))
    }

    /// Encode this frame into bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Write this frame to an async writer.
    pub async fn write_to<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        let encoded = self.encode();
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    /// Read a frame from an async reader.
    pub async fn read_from<R: AsyncReadExt + Unpin>(reader: &mut R) -> io::Result<Self> {
        let kind_byte = reader.read_u8().await?;
        let kind = CommandKind::from_u8(kind_byte).ok_or_else(|| unknown_kind(kind_byte))?;

        let length = reader.read_u32().await?;
        if length > MAX_PAYLOAD_SIZE {
            return Err(too_large(length));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;

        Ok(Self {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Decode one complete frame from a buffer, e.g. a WebSocket message.
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        if data.len() < 5 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "frame too short"));
        }

        let kind_byte = data.get_u8();
        let kind = CommandKind::from_u8(kind_byte).ok_or_else(|| unknown_kind(kind_byte))?;

        let length = data.get_u32();
        if length > MAX_PAYLOAD_SIZE {
            return Err(too_large(length));
        }
        if data.remaining() < length as usize {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            ));
        }

        Ok(Self {
            kind,
            payload: Bytes::copy_from_slice(&data[..length as usize]),
        })
    }

    /// Parse the payload as a JSON message.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Serialize a message into a frame payload.
pub fn encode_payload<T: Serialize>(msg: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(msg).map(Bytes::from)
}

fn unknown_kind(byte: u8) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unknown command kind: 0x{:02x}", byte),
    )
}

fn too_large(length: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame payload too large: {} bytes", length),
    )
}

// ── Message types ──────────────────────────────────────────────────

/// Worker -> hub: first frame on every worker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMsg {
    pub group: String,
    pub nickname: String,
}

/// Hub -> worker: registration accepted.
pub type RegisteredMsg = RegisterMsg;

/// Hub -> worker: run an action on behalf of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMsg {
    pub session: SessionId,
    pub action: String,
    #[serde(default)]
    pub args: String,
}

/// Hub -> worker and hub -> front-end: the session was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequestMsg {
    pub session: SessionId,
}

/// Worker -> hub, relayed hub -> front-end: a chunk of action output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputMsg {
    pub session: SessionId,
    #[serde(default)]
    pub machine: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Worker -> hub: one machine finished; hub -> front-end: the action finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneMsg {
    pub session: SessionId,
    #[serde(default)]
    pub machine: String,
    #[serde(default)]
    pub code: i32,
}

/// Error report in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: String,
    pub message: String,
}

/// Front-end -> hub: run `action` on the machines of `group`.
///
/// With `machine` set only that nickname is targeted; otherwise every
/// machine currently in the group receives the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMsg {
    pub group: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(default)]
    pub args: String,
}

/// Hub -> front-end: a session was created for a `Run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartedMsg {
    pub session: SessionId,
    pub action: String,
    pub machines: Vec<String>,
}

/// Front-end -> hub: cancel one of this front-end's sessions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CancelSessionMsg {
    pub session: SessionId,
}

/// Front-end -> hub: cancel every session running `action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelActionMsg {
    pub action: String,
}

/// Hub -> every front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMsg {
    pub header: String,
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Serde helper for base64-encoded byte vectors in JSON.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}
