//! Binary IPC framing.
//!
//! Wire frame: `[length: u32 BE][version: u8 = 0x01][type: u8][payload]`,
//! where `length` counts the whole frame including the 6-byte header. The
//! wire representation and the in-memory [`IpcMessage`] are distinct
//! types; nothing aliases a receive buffer as a struct.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 6;
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    TaskSubmit = 0x01,
    TaskQuery = 0x02,
    TaskCancel = 0x03,
    StreamSubscribe = 0x04,
    StreamData = 0x05,
    StreamComplete = 0x06,
    StreamError = 0x07,
    ResponseOk = 0x10,
    ResponseError = 0x11,
    Capabilities = 0x20,
    Ping = 0xF0,
    Pong = 0xF1,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        match value {
            0x01 => Some(MessageType::TaskSubmit),
            0x02 => Some(MessageType::TaskQuery),
            0x03 => Some(MessageType::TaskCancel),
            0x04 => Some(MessageType::StreamSubscribe),
            0x05 => Some(MessageType::StreamData),
            0x06 => Some(MessageType::StreamComplete),
            0x07 => Some(MessageType::StreamError),
            0x10 => Some(MessageType::ResponseOk),
            0x11 => Some(MessageType::ResponseError),
            0x20 => Some(MessageType::Capabilities),
            0xF0 => Some(MessageType::Ping),
            0xF1 => Some(MessageType::Pong),
            _ => None,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

/// Stable numeric error codes, wire-visible inside error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    #[error("Unsupported protocol version")]
    InvalidVersion,

    #[error("Unknown message type")]
    InvalidType,

    #[error("Frame too large")]
    FrameTooLarge,

    #[error("Invalid payload")]
    InvalidPayload,

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Internal error")]
    Internal,
}

impl IpcError {
    pub fn code(&self) -> u32 {
        match self {
            IpcError::InvalidVersion => 1,
            IpcError::InvalidType => 2,
            IpcError::FrameTooLarge => 3,
            IpcError::InvalidPayload => 4,
            IpcError::Timeout => 5,
            IpcError::ConnectionClosed => 6,
            IpcError::Internal => 99,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl IpcMessage {
    pub fn new(message_type: MessageType, payload: Bytes) -> Self {
        IpcMessage {
            message_type,
            payload,
        }
    }

    pub fn empty(message_type: MessageType) -> Self {
        IpcMessage {
            message_type,
            payload: Bytes::new(),
        }
    }
}

/// Builds the error-response message for a failed request:
/// `{"ok":false,"error":{"code":N,"message":S}}`.
pub fn error_response(error: IpcError, message: Option<&str>) -> IpcMessage {
    let body = serde_json::json!({
        "ok": false,
        "error": {
            "code": error.code(),
            "message": message.unwrap_or(&error.to_string()),
        }
    });
    IpcMessage::new(MessageType::ResponseError, Bytes::from(body.to_string()))
}

pub fn encode(message: &IpcMessage) -> Result<Bytes, IpcError> {
    let total = HEADER_SIZE + message.payload.len();
    if total > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge);
    }
    let mut frame = BytesMut::with_capacity(total);
    frame.put_u32(total as u32);
    frame.put_u8(PROTOCOL_VERSION);
    frame.put_u8(message.message_type.as_u8());
    frame.put_slice(&message.payload);
    Ok(frame.freeze())
}

/// Encodes into a caller-supplied buffer (the IPC server reuses pooled
/// scratch buffers for this).
pub fn encode_into(message: &IpcMessage, out: &mut BytesMut) -> Result<(), IpcError> {
    let total = HEADER_SIZE + message.payload.len();
    if total > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge);
    }
    out.reserve(total);
    out.put_u32(total as u32);
    out.put_u8(PROTOCOL_VERSION);
    out.put_u8(message.message_type.as_u8());
    out.put_slice(&message.payload);
    Ok(())
}

/// Decodes one complete frame. The slice must hold exactly the frame the
/// header describes.
pub fn decode(frame: &[u8]) -> Result<IpcMessage, IpcError> {
    if frame.len() < HEADER_SIZE {
        return Err(IpcError::InvalidPayload);
    }
    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if length != frame.len() {
        return Err(IpcError::InvalidPayload);
    }
    if length > MAX_FRAME_SIZE {
        return Err(IpcError::FrameTooLarge);
    }
    if frame[4] != PROTOCOL_VERSION {
        return Err(IpcError::InvalidVersion);
    }
    let message_type = MessageType::from_u8(frame[5]).ok_or(IpcError::InvalidType)?;
    Ok(IpcMessage {
        message_type,
        payload: Bytes::copy_from_slice(&frame[HEADER_SIZE..]),
    })
}

/// Peeks the length prefix of a partially-buffered frame.
pub fn peek_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize)
}
