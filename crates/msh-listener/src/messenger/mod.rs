//! Reliable message delivery over an outlet

mod backoff;
mod retry;

pub use backoff::ExponentialBackoff;
pub use retry::RetryingMessenger;

use std::time::Instant;

use msh_core::traits::Outlet;
use msh_core::MshError;
use msh_protocol::{Message, ProtocolError};

/// Encodes, sends and retries messages on behalf of sessions
pub trait Messenger: Send {
    /// Encode `message` and hand it to `outlet`, tracking it for retry
    fn send(&mut self, outlet: &mut dyn Outlet, message: &Message) -> Result<(), MshError>;

    /// Decode one received packet
    fn receive(&self, raw: &[u8]) -> Result<Message, ProtocolError>;

    /// Whether `outlet` can take another message right now
    fn is_outlet_ready(&self, outlet: &dyn Outlet) -> bool;

    /// Forget everything in flight on `outlet`
    fn clear_retries(&mut self, outlet: &dyn Outlet);

    /// Retire delivered messages and resend overdue ones
    fn service(&mut self, outlet: &mut dyn Outlet, now: Instant);
}
