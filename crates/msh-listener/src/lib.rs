//! msh-listener: Listener side of the msh session protocol
//!
//! The listener accepts links from remote initiators, authenticates them,
//! negotiates the protocol version, runs the requested command and streams
//! its output back. All session state lives on a single event loop task;
//! link I/O tasks and process reader threads only post events to it.

pub mod context;
pub mod event;
pub mod messenger;
pub mod process;
pub mod runtime;
pub mod server;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{ListenerContext, ListenerPolicy};
pub use event::{LinkEvent, LoopEvent};
pub use session::{ListenerSession, SessionRegistry, SessionState};
