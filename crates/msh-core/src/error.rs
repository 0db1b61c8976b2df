//! Core error types for msh

use msh_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the msh ecosystem
#[derive(Error, Debug)]
pub enum MshError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Outlet error
    #[error("Outlet error: {0}")]
    Outlet(#[from] OutletError),

    /// Process error
    #[error("Process error: {0}")]
    Process(#[from] ProcessError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by a link outlet
#[derive(Error, Debug)]
pub enum OutletError {
    /// The link has been closed or torn down
    #[error("Link closed")]
    Closed,

    /// Packet is larger than the link can carry
    #[error("Packet of {size} bytes exceeds link MDU of {mdu} bytes")]
    TooLarge { size: usize, mdu: usize },

    /// Transport-specific failure
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Errors raised by a child process handle
#[derive(Error, Debug)]
pub enum ProcessError {
    /// No command to run
    #[error("Empty command line")]
    EmptyCommand,

    /// Spawning the child failed
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    /// Child stdin was already closed
    #[error("Stdin already closed")]
    StdinClosed,

    /// Child has already exited
    #[error("Process not running")]
    NotRunning,

    /// Terminal operation failed
    #[error("Terminal error: {0}")]
    Terminal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reasons a listener session ends abnormally
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Message arrived that the current state does not accept
    #[error("Protocol error ({0})")]
    Protocol(String),

    /// A watchdog fired while its guard still held
    #[error("Protocol timeout error: {0}")]
    Timeout(String),

    /// Identity is not in the allow-list
    #[error("Identity is not allowed.")]
    IdentityNotAllowed,

    /// Peer speaks another protocol version
    #[error("Incompatible protocol")]
    IncompatibleProtocol,

    /// Remote command line supplied while the listener forbids it
    #[error("Remote command line not allowed by listener")]
    RemoteCommandNotAllowed,

    /// Child process could not be started
    #[error("Unable to start process")]
    ProcessStart,
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// Identity hash could not be parsed
    #[error("Invalid identity hash '{value}': {reason}")]
    InvalidIdentity { value: String, reason: String },

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
