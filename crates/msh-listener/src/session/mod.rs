//! Listener sessions
//!
//! One [`ListenerSession`] per accepted link, owned by the
//! [`SessionRegistry`] together with the timers that supervise it.

mod listener;
mod registry;
mod state;
mod timers;

pub use listener::ListenerSession;
pub use registry::SessionRegistry;
pub use state::SessionState;
pub use timers::{TimerKind, TimerQueue};
