//! NSQ TCP protocol (V2) framing and commands.
//!
//! Frames sent by nsqd are `[size: u32][type: u32][data]`, big endian, where
//! `size` counts the type field and the data. Message frames carry
//! `[timestamp: i64][attempts: u16][id: 16 bytes][body]`.

use crate::constants::MAX_NSQ_FRAME_SIZE;
use crate::queue::QueueError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Protocol magic sent once after connecting.
pub const MAGIC_V2: &[u8; 4] = b"  V2";

/// Body of the response frame nsqd uses as a heartbeat.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Reply to a successful command.
pub const OK: &[u8] = b"OK";

/// Reply to `CLS`.
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

const FRAME_TYPE_RESPONSE: u32 = 0;
const FRAME_TYPE_ERROR: u32 = 1;
const FRAME_TYPE_MESSAGE: u32 = 2;

/// Message header length: timestamp, attempts, id.
const MESSAGE_HEADER_LEN: usize = 8 + 2 + 16;

/// Message id as assigned by nsqd.
pub type MessageId = [u8; 16];

/// A message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl Message {
    /// Printable form of the id (nsqd ids are ASCII hex).
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Message),
}

impl Frame {
    /// Returns true for the heartbeat response.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Response(data) if data.as_ref() == HEARTBEAT)
    }

    /// Decodes the type and payload of a frame.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Protocol`] for unknown frame types or truncated
    /// message frames.
    pub fn decode(frame_type: u32, data: Bytes) -> Result<Self, QueueError> {
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Self::Response(data)),
            FRAME_TYPE_ERROR => Ok(Self::Error(data)),
            FRAME_TYPE_MESSAGE => {
                if data.len() < MESSAGE_HEADER_LEN {
                    return Err(QueueError::Protocol(format!(
                        "message frame too short ({} bytes)",
                        data.len()
                    )));
                }
                let mut timestamp = [0u8; 8];
                timestamp.copy_from_slice(&data[..8]);
                let mut attempts = [0u8; 2];
                attempts.copy_from_slice(&data[8..10]);
                let mut id = [0u8; 16];
                id.copy_from_slice(&data[10..MESSAGE_HEADER_LEN]);
                Ok(Self::Message(Message {
                    timestamp: i64::from_be_bytes(timestamp),
                    attempts: u16::from_be_bytes(attempts),
                    id,
                    body: data.slice(MESSAGE_HEADER_LEN..),
                }))
            },
            other => Err(QueueError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

/// Reads one frame.
///
/// Not cancel safe: a partially read frame is lost if the future is dropped.
/// Callers run it in a dedicated reader task.
///
/// # Errors
///
/// Returns I/O errors from the socket and [`QueueError::Protocol`] for
/// oversized or malformed frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, QueueError>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u32().await? as usize;
    if size < 4 || size > MAX_NSQ_FRAME_SIZE {
        return Err(QueueError::Protocol(format!("invalid frame size {size}")));
    }
    let frame_type = reader.read_u32().await?;
    let mut data = vec![0u8; size - 4];
    reader.read_exact(&mut data).await?;
    Frame::decode(frame_type, Bytes::from(data))
}

/// Client metadata sent with `IDENTIFY`.
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    /// Disabled so nsqd answers with a plain `OK`.
    pub feature_negotiation: bool,
}

impl Identify {
    pub fn new(client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        Self {
            hostname: client_id.clone(),
            client_id,
            user_agent: format!("pinnerd/{}", env!("CARGO_PKG_VERSION")),
            feature_negotiation: false,
        }
    }
}

/// Commands the client sends.
#[derive(Debug, Clone)]
pub enum Command<'a> {
    Identify(&'a Identify),
    Sub { topic: &'a str, channel: &'a str },
    Rdy(u32),
    Fin(&'a MessageId),
    Req { id: &'a MessageId, timeout_ms: u64 },
    Nop,
    Cls,
    Pub { topic: &'a str, body: &'a [u8] },
}

impl Command<'_> {
    /// Appends the wire form to `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if the `IDENTIFY` body cannot be serialized.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), QueueError> {
        match self {
            Self::Identify(identify) => {
                let body = serde_json::to_vec(identify)
                    .map_err(|e| QueueError::Protocol(format!("identify: {e}")))?;
                buf.put_slice(b"IDENTIFY\n");
                put_sized(buf, &body);
            },
            Self::Sub { topic, channel } => {
                buf.put_slice(format!("SUB {topic} {channel}\n").as_bytes());
            },
            Self::Rdy(count) => buf.put_slice(format!("RDY {count}\n").as_bytes()),
            Self::Fin(id) => {
                buf.put_slice(b"FIN ");
                buf.put_slice(&id[..]);
                buf.put_u8(b'\n');
            },
            Self::Req { id, timeout_ms } => {
                buf.put_slice(b"REQ ");
                buf.put_slice(&id[..]);
                buf.put_slice(format!(" {timeout_ms}\n").as_bytes());
            },
            Self::Nop => buf.put_slice(b"NOP\n"),
            Self::Cls => buf.put_slice(b"CLS\n"),
            Self::Pub { topic, body } => {
                buf.put_slice(format!("PUB {topic}\n").as_bytes());
                put_sized(buf, body);
            },
        }
        Ok(())
    }
}

fn put_sized(buf: &mut BytesMut, body: &[u8]) {
    // Bodies are bounded by MAX_NSQ_FRAME_SIZE well below u32::MAX.
    #[allow(clippy::cast_possible_truncation)]
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
}
