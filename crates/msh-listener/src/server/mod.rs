//! TCP link binding
//!
//! A development transport: each TCP connection is one link, carrying
//! length-prefixed link frames. The initiator declares its identity hash
//! in an `Identify` frame; nothing verifies it cryptographically.

mod link;
mod listener;

pub use link::{serve_link, LinkConfig, TcpOutlet};
pub use listener::LinkServer;
