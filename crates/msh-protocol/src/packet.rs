//! Packet encoding: one message per transport unit
//!
//! Layout:
//! - message_type: 1 byte
//! - body: depends on the type
//!
//! `StreamData` bodies are packed by hand so the per-chunk overhead stays
//! fixed and small: stream id (1 byte), flags (1 byte, bit 0 = EOF), then
//! the raw payload. `CommandExited` carries a big-endian i32. `Noop` has no
//! body. All other bodies are bincode-serialized.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::message::{Message, MessageType, StreamData, StreamId};

/// Bytes a `StreamData` packet adds on top of its payload
pub const STREAM_DATA_OVERHEAD: usize = 3;

const FLAG_EOF: u8 = 0x01;

/// Encode a message into a single packet
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    dst.put_u8(message.message_type().as_u8());

    match message {
        Message::VersionInfo(info) => dst.extend_from_slice(&bincode::serialize(info)?),
        Message::ExecuteCommand(cmd) => dst.extend_from_slice(&bincode::serialize(cmd)?),
        Message::WindowSize(size) => dst.extend_from_slice(&bincode::serialize(size)?),
        Message::StreamData(chunk) => {
            dst.reserve(STREAM_DATA_OVERHEAD - 1 + chunk.data.len());
            dst.put_u8(chunk.stream.as_u8());
            dst.put_u8(if chunk.eof { FLAG_EOF } else { 0 });
            dst.extend_from_slice(&chunk.data);
        }
        Message::Noop => {}
        Message::CommandExited { return_code } => dst.put_i32(*return_code),
        Message::Error(err) => dst.extend_from_slice(&bincode::serialize(err)?),
    }

    Ok(dst.freeze())
}

/// Decode a packet into a message
pub fn decode(raw: &[u8]) -> Result<Message, ProtocolError> {
    let (&type_byte, body) = raw.split_first().ok_or(ProtocolError::EmptyPacket)?;
    let message_type =
        MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;

    let message = match message_type {
        MessageType::VersionInfo => Message::VersionInfo(bincode::deserialize(body)?),
        MessageType::ExecuteCommand => Message::ExecuteCommand(bincode::deserialize(body)?),
        MessageType::WindowSize => Message::WindowSize(bincode::deserialize(body)?),
        MessageType::StreamData => {
            if body.len() < STREAM_DATA_OVERHEAD - 1 {
                return Err(ProtocolError::Truncated {
                    expected: STREAM_DATA_OVERHEAD - 1,
                    actual: body.len(),
                });
            }
            let stream =
                StreamId::from_u8(body[0]).ok_or(ProtocolError::InvalidStreamId(body[0]))?;
            let eof = body[1] & FLAG_EOF != 0;
            Message::StreamData(StreamData {
                stream,
                data: Bytes::copy_from_slice(&body[2..]),
                eof,
            })
        }
        MessageType::Noop => Message::Noop,
        MessageType::CommandExited => {
            let mut body = body;
            if body.remaining() < 4 {
                return Err(ProtocolError::Truncated {
                    expected: 4,
                    actual: body.remaining(),
                });
            }
            Message::CommandExited {
                return_code: body.get_i32(),
            }
        }
        MessageType::Error => Message::Error(bincode::deserialize(body)?),
    };

    Ok(message)
}
