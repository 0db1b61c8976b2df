//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol data
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Packet carried no bytes at all
    #[error("Empty packet")]
    EmptyPacket,

    /// Unknown message type
    #[error("Unknown message type: {0:#04x}")]
    UnknownMessageType(u8),

    /// Unknown link frame kind
    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    /// Stream tag outside of stdin/stdout/stderr
    #[error("Invalid stream id: {0}")]
    InvalidStreamId(u8),

    /// Payload exceeds maximum size
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Packet or frame body shorter than its type requires
    #[error("Truncated data: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
