//! Events marshalled onto the listener loop
//!
//! Link bindings and process readers never touch session state directly.
//! They post a [`LoopEvent`] and the loop applies it to the owning session.

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;

use msh_core::traits::{Outlet, OutputSink, ProcessOutput};
use msh_core::IdentityHash;
use msh_protocol::LinkId;

/// Notifications raised by a link binding
pub enum LinkEvent {
    /// A new link was accepted; the session takes ownership of its outlet
    Established { outlet: Box<dyn Outlet> },
    /// The initiator proved its identity
    IdentityConfirmed { link: LinkId, identity: IdentityHash },
    /// One raw packet arrived
    PacketReceived { link: LinkId, raw: Bytes },
    /// The link went away
    LinkClosed { link: LinkId },
}

impl LinkEvent {
    /// Link the event refers to
    pub fn link(&self) -> LinkId {
        match self {
            LinkEvent::Established { outlet } => outlet.link_id(),
            LinkEvent::IdentityConfirmed { link, .. }
            | LinkEvent::PacketReceived { link, .. }
            | LinkEvent::LinkClosed { link } => *link,
        }
    }
}

impl fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Established { outlet } => f
                .debug_struct("Established")
                .field("link", &outlet.link_id())
                .finish(),
            LinkEvent::IdentityConfirmed { link, identity } => f
                .debug_struct("IdentityConfirmed")
                .field("link", link)
                .field("identity", identity)
                .finish(),
            LinkEvent::PacketReceived { link, raw } => f
                .debug_struct("PacketReceived")
                .field("link", link)
                .field("len", &raw.len())
                .finish(),
            LinkEvent::LinkClosed { link } => {
                f.debug_struct("LinkClosed").field("link", link).finish()
            }
        }
    }
}

/// Everything the listener loop consumes
#[derive(Debug)]
pub enum LoopEvent {
    /// Link binding notification
    Link(LinkEvent),
    /// Output or exit of a session's child process
    Process { link: LinkId, output: ProcessOutput },
}

impl From<LinkEvent> for LoopEvent {
    fn from(event: LinkEvent) -> Self {
        LoopEvent::Link(event)
    }
}

/// Sender half of the loop queue
pub type EventSender = mpsc::UnboundedSender<LoopEvent>;

/// Receiver half of the loop queue
pub type EventReceiver = mpsc::UnboundedReceiver<LoopEvent>;

/// Create the loop queue
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Routes one child's output onto the loop, tagged with its link
pub struct ChannelSink {
    link: LinkId,
    tx: EventSender,
}

impl ChannelSink {
    pub fn new(link: LinkId, tx: EventSender) -> Self {
        Self { link, tx }
    }
}

impl OutputSink for ChannelSink {
    fn deliver(&self, output: ProcessOutput) {
        if self
            .tx
            .send(LoopEvent::Process {
                link: self.link,
                output,
            })
            .is_err()
        {
            tracing::debug!("Loop closed, dropping process output for {}", self.link);
        }
    }
}
