//! Message types for the msh session protocol
//!
//! This module defines the closed set of messages a listener session
//! consumes and produces. Each message travels in exactly one transport
//! unit; the packet layout lives in `packet.rs`.
//!
//! # Message Flow
//!
//! Typical sequence on a link, after the transport confirms the initiator's
//! identity:
//!
//! 1. Initiator sends `VersionInfo`, listener answers with its own `VersionInfo`
//! 2. Initiator sends `ExecuteCommand` with the command line and terminal setup
//! 3. Initiator streams `StreamData` on stdin and `WindowSize` updates
//! 4. Listener streams `StreamData` on stdout/stderr, then `CommandExited`
//! 5. `Noop` may be sent by the initiator at any time; the listener echoes it
//! 6. `Error` carries a human-readable reason, fatal errors end the session

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Magic prefix occupying the upper 32 bits of every protocol version.
pub const PROTOCOL_MAGIC: u32 = 0xdead_beef;

/// Build a protocol version number from its revision.
pub const fn make_protocol_version(revision: u32) -> u64 {
    ((PROTOCOL_MAGIC as u64) << 32) | revision as u64
}

/// Split a protocol version into `(magic, revision)`.
pub const fn split_protocol_version(version: u64) -> (u32, u32) {
    ((version >> 32) as u32, version as u32)
}

/// Current protocol version. Both sides must match exactly.
pub const PROTOCOL_VERSION: u64 = make_protocol_version(1);

/// Software version advertised in `VersionInfo`.
pub const SW_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Terminal window geometry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of rows
    pub rows: u16,
    /// Number of columns
    pub cols: u16,
    /// Width in pixels
    pub hpix: u16,
    /// Height in pixels
    pub vpix: u16,
}

impl WindowSize {
    /// Create a window size without pixel dimensions
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            hpix: 0,
            vpix: 0,
        }
    }

    /// Set pixel dimensions
    pub fn with_pixels(mut self, hpix: u16, vpix: u16) -> Self {
        self.hpix = hpix;
        self.vpix = vpix;
        self
    }

    /// True when no character geometry was supplied
    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

/// Which standard stream a `StreamData` message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamId {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl StreamId {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamId::Stdin => write!(f, "stdin"),
            StreamId::Stdout => write!(f, "stdout"),
            StreamId::Stderr => write!(f, "stderr"),
        }
    }
}

/// Version announcement exchanged right after identification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    /// Software version of the sender
    pub sw_version: String,
    /// Protocol version of the sender
    pub protocol_version: u64,
}

impl VersionInfo {
    /// Version info describing this build
    pub fn current() -> Self {
        Self {
            sw_version: SW_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self::current()
    }
}

/// Request to start a command on the listener
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteCommand {
    /// Remote command line; empty means "run the listener's default"
    pub cmdline: Vec<String>,
    /// Initiator's stdin is a pipe rather than a terminal
    pub pipe_stdin: bool,
    /// Initiator's stdout is a pipe rather than a terminal
    pub pipe_stdout: bool,
    /// Initiator's stderr is a pipe rather than a terminal
    pub pipe_stderr: bool,
    /// Opaque terminal attributes of the initiator
    pub tcflags: Option<Vec<u8>>,
    /// Initiator's TERM value
    pub term: Option<String>,
    /// Initial window geometry
    pub window: WindowSize,
}

/// A chunk of one standard stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamData {
    /// Stream this chunk belongs to
    pub stream: StreamId,
    /// Payload, possibly empty when only signalling EOF
    pub data: Bytes,
    /// Last chunk of the stream
    pub eof: bool,
}

impl StreamData {
    /// Create a stream chunk
    pub fn new(stream: StreamId, data: impl Into<Bytes>, eof: bool) -> Self {
        Self {
            stream,
            data: data.into(),
            eof,
        }
    }
}

/// Error report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Human-readable reason
    pub message: String,
    /// Whether the sender is ending the session
    pub fatal: bool,
}

impl ErrorMessage {
    /// Create a fatal error report
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

/// Message type identifier, the first byte of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Version announcement
    VersionInfo = 0x01,
    /// Command execution request
    ExecuteCommand = 0x02,
    /// Terminal resize event
    WindowSize = 0x03,
    /// Standard stream data
    StreamData = 0x04,
    /// Keepalive probe
    Noop = 0x05,
    /// Process exit status
    CommandExited = 0x06,
    /// Error report
    Error = 0xFF,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::VersionInfo),
            0x02 => Some(Self::ExecuteCommand),
            0x03 => Some(Self::WindowSize),
            0x04 => Some(Self::StreamData),
            0x05 => Some(Self::Noop),
            0x06 => Some(Self::CommandExited),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Version announcement
    VersionInfo(VersionInfo),
    /// Command execution request
    ExecuteCommand(ExecuteCommand),
    /// Terminal resize
    WindowSize(WindowSize),
    /// Standard stream data
    StreamData(StreamData),
    /// Keepalive probe, echoed back by the listener
    Noop,
    /// The command finished with this exit code
    CommandExited {
        /// Process exit code
        return_code: i32,
    },
    /// Error report
    Error(ErrorMessage),
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::VersionInfo(_) => MessageType::VersionInfo,
            Message::ExecuteCommand(_) => MessageType::ExecuteCommand,
            Message::WindowSize(_) => MessageType::WindowSize,
            Message::StreamData(_) => MessageType::StreamData,
            Message::Noop => MessageType::Noop,
            Message::CommandExited { .. } => MessageType::CommandExited,
            Message::Error(_) => MessageType::Error,
        }
    }

    /// Short name used in logs and protocol error reasons
    pub fn name(&self) -> &'static str {
        match self {
            Message::VersionInfo(_) => "VersionInfo",
            Message::ExecuteCommand(_) => "ExecuteCommand",
            Message::WindowSize(_) => "WindowSize",
            Message::StreamData(_) => "StreamData",
            Message::Noop => "Noop",
            Message::CommandExited { .. } => "CommandExited",
            Message::Error(_) => "Error",
        }
    }
}
