//! Listener configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the listener daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address the TCP link binding listens on
    pub bind_address: String,

    /// Maximum data unit advertised for each link
    pub link_mdu: usize,

    /// Command run for every session; empty means the user's `$SHELL`
    pub default_command: Vec<String>,

    /// Accept any remote identity
    pub allow_all: bool,

    /// Identity hashes (32 hex characters) allowed to connect
    pub allowed_identities: Vec<String>,

    /// Accept a command line supplied by the remote side
    pub allow_remote_command: bool,

    /// Append the remote command line to the default command as arguments
    pub remote_command_as_args: bool,

    /// Interval between scheduler ticks
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,

    /// Interval between RTT probes on each link
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Protocol timeout policy
    pub timeouts: TimeoutConfig,

    /// Reliable delivery settings
    pub messenger: MessengerConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:4242".to_string(),
            link_mdu: 431,
            default_command: Vec::new(),
            allow_all: false,
            allowed_identities: Vec::new(),
            allow_remote_command: false,
            remote_command_as_args: false,
            tick_interval: Duration::from_millis(5),
            keepalive_interval: Duration::from_secs(30),
            timeouts: TimeoutConfig::default(),
            messenger: MessengerConfig::default(),
        }
    }
}

/// Timeouts derived from the link round-trip time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// RTT multiplier for per-state watchdogs
    pub protocol_factor: u32,

    /// RTT multiplier for the post-exit watchdog
    pub exit_factor: u32,

    /// Lower bound for both watchdogs
    #[serde(with = "duration_secs")]
    pub minimum: Duration,

    /// RTT multiplier for the delay between error and teardown
    pub prune_factor: u32,

    /// Lower bound for the prune delay
    #[serde(with = "duration_secs")]
    pub prune_minimum: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            protocol_factor: 10,
            exit_factor: 5,
            minimum: Duration::from_secs(10),
            prune_factor: 3,
            prune_minimum: Duration::from_secs(5),
        }
    }
}

impl TimeoutConfig {
    /// Watchdog delay for a non-terminal state
    pub fn protocol_timeout(&self, rtt: Duration) -> Duration {
        rtt.saturating_mul(self.protocol_factor).max(rtt.saturating_mul(2).max(self.minimum))
    }

    /// Watchdog delay after the exit code was sent
    pub fn exit_timeout(&self, rtt: Duration) -> Duration {
        rtt.saturating_mul(self.exit_factor).max(self.minimum)
    }

    /// Delay between entering the error state and teardown
    pub fn prune_delay(&self, rtt: Duration) -> Duration {
        rtt.saturating_mul(self.prune_factor).max(self.prune_minimum)
    }
}

/// Retrying messenger settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerConfig {
    /// Delay between delivery attempts
    pub backoff: BackoffConfig,

    /// Attempts per message before the link is timed out
    pub max_attempts: u32,

    /// Unconfirmed messages allowed per link before sends are held back
    pub max_in_flight: usize,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_attempts: 15,
            max_in_flight: 4,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
