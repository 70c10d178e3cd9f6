//! Wire framing for peer messages.
//!
//! One message on the wire:
//!
//! ```text
//! u32  length         // length of Data
//! u8   version        // = 1
//! u8   type           // 1=Request, 2=Response, 3=Stream
//! u16  metadata_count
//! repeat: u16 klen, key bytes, u32 vlen, value bytes
//! bytes Data[length]
//! ```
//!
//! Request data carries `u16 scope_len, scope, payload`; response data
//! carries `u8 is_error, payload`; stream data carries the scope header and
//! is followed by framed blocks of `u32 len, payload`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const WIRE_VERSION: u8 = 1;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("truncated frame")]
    Truncated,
    #[error("unsupported wire version {0}")]
    Version(u8),
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request = 1,
    Response = 2,
    Stream = 3,
}

impl MessageKind {
    fn from_u8(raw: u8) -> Result<Self, ProtocolError> {
        match raw {
            1 => Ok(MessageKind::Request),
            2 => Ok(MessageKind::Response),
            3 => Ok(MessageKind::Stream),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageKind,
    pub metadata: Vec<(String, Vec<u8>)>,
    pub data: Bytes,
}

impl Message {
    pub fn new(kind: MessageKind, data: Bytes) -> Self {
        Self {
            kind,
            metadata: Vec::new(),
            data,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.data.len());
        buf.put_u32(self.data.len() as u32);
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.metadata.len() as u16);
        for (key, value) in &self.metadata {
            buf.put_u16(key.len() as u16);
            buf.put_slice(key.as_bytes());
            buf.put_u32(value.len() as u32);
            buf.put_slice(value);
        }
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.remaining() < 8 {
            return Err(ProtocolError::Truncated);
        }
        let data_len = buf.get_u32() as usize;
        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(ProtocolError::Version(version));
        }
        let kind = MessageKind::from_u8(buf.get_u8())?;
        let metadata_count = buf.get_u16() as usize;

        let mut metadata = Vec::with_capacity(metadata_count);
        for _ in 0..metadata_count {
            if buf.remaining() < 2 {
                return Err(ProtocolError::Truncated);
            }
            let klen = buf.get_u16() as usize;
            if buf.remaining() < klen {
                return Err(ProtocolError::Truncated);
            }
            let key = String::from_utf8(buf.copy_to_bytes(klen).to_vec())
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            if buf.remaining() < 4 {
                return Err(ProtocolError::Truncated);
            }
            let vlen = buf.get_u32() as usize;
            if buf.remaining() < vlen {
                return Err(ProtocolError::Truncated);
            }
            metadata.push((key, buf.copy_to_bytes(vlen).to_vec()));
        }

        if buf.remaining() < data_len {
            return Err(ProtocolError::Truncated);
        }
        let data = buf.copy_to_bytes(data_len);
        Ok(Self {
            kind,
            metadata,
            data,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub scope: String,
    pub payload: Bytes,
}

impl Request {
    pub fn into_message(self) -> Message {
        let mut buf = BytesMut::with_capacity(2 + self.scope.len() + self.payload.len());
        buf.put_u16(self.scope.len() as u16);
        buf.put_slice(self.scope.as_bytes());
        buf.put_slice(&self.payload);
        Message::new(MessageKind::Request, buf.freeze())
    }

    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let mut data = message.data.clone();
        let scope = read_scope(&mut data)?;
        Ok(Self {
            scope,
            payload: data,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub is_error: bool,
    pub payload: Bytes,
}

impl Response {
    pub fn ok(payload: Bytes) -> Self {
        Self {
            is_error: false,
            payload,
        }
    }

    pub fn error(reason: &str) -> Self {
        Self {
            is_error: true,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    pub fn into_message(self) -> Message {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.is_error as u8);
        buf.put_slice(&self.payload);
        Message::new(MessageKind::Response, buf.freeze())
    }

    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let mut data = message.data.clone();
        if data.remaining() < 1 {
            return Err(ProtocolError::Truncated);
        }
        let is_error = data.get_u8() != 0;
        Ok(Self {
            is_error,
            payload: data,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub scope: String,
}

impl StreamHeader {
    pub fn into_message(self) -> Message {
        let mut buf = BytesMut::with_capacity(2 + self.scope.len());
        buf.put_u16(self.scope.len() as u16);
        buf.put_slice(self.scope.as_bytes());
        Message::new(MessageKind::Stream, buf.freeze())
    }

    pub fn from_message(message: &Message) -> Result<Self, ProtocolError> {
        let mut data = message.data.clone();
        let scope = read_scope(&mut data)?;
        Ok(Self { scope })
    }
}

/// Frames one stream block: `u32 len, payload`.
pub fn encode_block(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn decode_block(mut buf: Bytes) -> Result<Bytes, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    Ok(buf.copy_to_bytes(len))
}

fn read_scope(data: &mut Bytes) -> Result<String, ProtocolError> {
    if data.remaining() < 2 {
        return Err(ProtocolError::Truncated);
    }
    let len = data.get_u16() as usize;
    if data.remaining() < len {
        return Err(ProtocolError::Truncated);
    }
    String::from_utf8(data.copy_to_bytes(len).to_vec())
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}
