//! Link outlet trait

use bytes::Bytes;
use std::time::Duration;

use crate::error::OutletError;
use msh_protocol::LinkId;

/// Token identifying one outbound packet on an outlet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt(pub u64);

/// Delivery state of an outbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptState {
    /// Handed to the transport, not yet confirmed
    Sent,
    /// Confirmed by the transport
    Delivered,
    /// The transport gave up on it
    Failed,
}

/// Abstraction over one bidirectional link to a single remote peer
///
/// Identity confirmation, packet arrival and link closure are not callbacks
/// on this trait: bindings push them as events onto the listener loop. The
/// outlet only gates which of them the binding forwards.
pub trait Outlet: Send {
    /// Identifier of the underlying link
    fn link_id(&self) -> LinkId;

    /// Largest packet the link can carry right now
    fn mdu(&self) -> usize;

    /// Current round-trip-time estimate
    fn rtt(&self) -> Duration;

    /// Send one encoded packet
    fn send(&mut self, raw: Bytes) -> Result<Receipt, OutletError>;

    /// Delivery state of a previously sent packet
    fn receipt_state(&self, receipt: Receipt) -> ReceiptState;

    /// Start forwarding received packets; called once the peer is identified
    fn enable_packets(&mut self);

    /// Stop forwarding the link-closed notification
    fn disable_link_closed(&mut self);

    /// Whether the link can currently carry traffic
    fn is_usable(&self) -> bool;

    /// Close the link; calling it again is a no-op
    fn teardown(&mut self) -> Result<(), OutletError>;

    /// Delivery gave up on this link
    fn timed_out(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::debug!("Teardown of {} after timeout failed: {}", self.link_id(), e);
        }
    }
}
