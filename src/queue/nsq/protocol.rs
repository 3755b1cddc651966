//! NSQ TCP protocol (V2) framing
//!
//! Client commands are newline-terminated text, optionally followed by a
//! 4-byte big-endian length and a body. Server frames are
//! `size: u32 | frame_type: u32 | data`, where `size` counts the frame type
//! and the data. Message frames carry
//! `timestamp: i64 | attempts: u16 | id: [u8; 16] | body`.

use crate::queue::{MessageId, MESSAGE_ID_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAGIC_V2: &[u8] = b"  V2";
pub const HEARTBEAT: &[u8] = b"_heartbeat_";
pub const OK: &[u8] = b"OK";
pub const CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

/// Upper bound on an incoming frame; larger sizes mean a corrupt stream.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("frame of {0} bytes is too small")]
    FrameTooSmall(usize),

    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),

    #[error("message frame of {0} bytes is shorter than its header")]
    MessageTooShort(usize),

    #[error("failed to encode IDENTIFY body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Body of the IDENTIFY command.
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
    /// Milliseconds
    pub heartbeat_interval: u64,
    /// Milliseconds
    pub msg_timeout: u64,
}

#[derive(Debug, Clone)]
pub enum Command {
    Identify(Identify),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req(MessageId, Duration),
    Nop,
    Cls,
}

impl Command {
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Command::Identify(identify) => {
                let body = serde_json::to_vec(identify)?;
                buf.put_slice(b"IDENTIFY\n");
                buf.put_u32(body.len() as u32);
                buf.put_slice(&body);
            }
            Command::Sub { topic, channel } => {
                buf.put_slice(format!("SUB {} {}\n", topic, channel).as_bytes());
            }
            Command::Rdy(count) => {
                buf.put_slice(format!("RDY {}\n", count).as_bytes());
            }
            Command::Fin(id) => {
                buf.put_slice(b"FIN ");
                buf.put_slice(id.as_bytes());
                buf.put_u8(b'\n');
            }
            Command::Req(id, delay) => {
                buf.put_slice(b"REQ ");
                buf.put_slice(id.as_bytes());
                buf.put_slice(format!(" {}\n", delay.as_millis()).as_bytes());
            }
            Command::Nop => buf.put_slice(b"NOP\n"),
            Command::Cls => buf.put_slice(b"CLS\n"),
        }
        Ok(buf.freeze())
    }
}

/// A message as it arrives on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl RawMessage {
    pub fn parse(data: Bytes) -> Result<Self, ProtocolError> {
        if data.len() < MESSAGE_HEADER_LEN {
            return Err(ProtocolError::MessageTooShort(data.len()));
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[0..8]);
        let mut id = [0u8; MESSAGE_ID_LEN];
        id.copy_from_slice(&data[10..MESSAGE_HEADER_LEN]);

        Ok(Self {
            timestamp: i64::from_be_bytes(ts),
            attempts: u16::from_be_bytes([data[8], data[9]]),
            id: MessageId::new(id),
            body: data.slice(MESSAGE_HEADER_LEN..),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(RawMessage),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(data) if data.as_ref() == HEARTBEAT)
    }
}

/// Read one frame. Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R, max_size: usize) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let size = u32::from_be_bytes(len_buf) as usize;
    if size < 4 {
        return Err(ProtocolError::FrameTooSmall(size));
    }
    if size > max_size {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: max_size,
        });
    }

    let mut buf = BytesMut::zeroed(size);
    reader.read_exact(&mut buf).await?;
    let mut data = buf.freeze();
    let frame_type = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let data = data.split_off(4);

    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
        FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
        FRAME_TYPE_MESSAGE => Ok(Some(Frame::Message(RawMessage::parse(data)?))),
        other => Err(ProtocolError::UnknownFrameType(other)),
    }
}

/// Encode a server frame. Used by tests standing in for nsqd.
pub fn encode_frame(frame_type: u32, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + data.len());
    buf.put_u32((data.len() + 4) as u32);
    buf.put_u32(frame_type);
    buf.put_slice(data);
    buf.freeze()
}

/// Encode a message frame body. Used by tests standing in for nsqd.
pub fn encode_message(timestamp: i64, attempts: u16, id: &MessageId, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LEN + body.len());
    buf.put_i64(timestamp);
    buf.put_u16(attempts);
    buf.put_slice(id.as_bytes());
    buf.put_slice(body);
    encode_frame(FRAME_TYPE_MESSAGE, &buf)
}
