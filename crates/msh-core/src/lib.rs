//! msh-core: Core abstractions and configuration for msh
//!
//! This crate provides the shared types, the collaborator traits a listener
//! session is written against (link outlet, child process), the error
//! hierarchy and the listener configuration.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::MshError;
pub use types::IdentityHash;
