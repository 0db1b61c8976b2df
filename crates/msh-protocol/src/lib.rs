//! msh-protocol: Wire protocol for msh listener sessions
//!
//! This crate defines the messages exchanged between an initiator and a
//! listener over a single link, the packet encoding used to carry one
//! message per transport unit, and the frame codec used by stream-based
//! link bindings.

pub mod codec;
pub mod error;
pub mod frame;
pub mod link;
pub mod message;
pub mod packet;

pub use codec::{FrameCodec, LinkFrame};
pub use error::ProtocolError;
pub use frame::{FrameHeader, FrameKind, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use link::LinkId;
pub use message::{
    ErrorMessage, ExecuteCommand, Message, MessageType, StreamData, StreamId, VersionInfo,
    WindowSize, PROTOCOL_VERSION,
};
