//! Process-wide listener context
//!
//! Built once at startup from [`ListenerConfig`] and read-only afterwards.
//! Sessions borrow it for policy decisions, message delivery and process
//! spawning.

use std::collections::HashSet;
use std::sync::Arc;

use msh_core::config::{ListenerConfig, TimeoutConfig};
use msh_core::error::{ConfigError, SessionError};
use msh_core::traits::{OutputSink, ProcessSpawner};
use msh_core::IdentityHash;
use msh_protocol::LinkId;

use crate::event::{ChannelSink, EventSender};
use crate::messenger::Messenger;

/// Environment variable exposing the verified peer identity to the child
pub const REMOTE_IDENTITY_ENV: &str = "MSH_REMOTE_IDENTITY";

/// Authorization and command policy
#[derive(Debug, Clone)]
pub struct ListenerPolicy {
    /// Accept any identity
    pub allow_all: bool,
    /// Identities accepted when `allow_all` is off
    pub allowed_identities: HashSet<IdentityHash>,
    /// Accept remote command lines
    pub allow_remote_command: bool,
    /// Append remote command lines to the default command
    pub remote_command_as_args: bool,
    /// Command run when the initiator supplies none
    pub default_command: Arc<[String]>,
    /// Watchdog and prune delays
    pub timeouts: TimeoutConfig,
}

impl ListenerPolicy {
    /// Validate a configuration and build the policy from it
    ///
    /// An empty `default_command` falls back to `$SHELL`.
    pub fn from_config(config: &ListenerConfig) -> Result<Self, ConfigError> {
        let allowed_identities = config
            .allowed_identities
            .iter()
            .map(|value| IdentityHash::from_hex(value.trim()))
            .collect::<Result<HashSet<_>, _>>()?;

        let default_command = if config.default_command.is_empty() {
            match std::env::var("SHELL") {
                Ok(shell) if !shell.is_empty() => {
                    tracing::info!("Using {} for default command", shell);
                    vec![shell]
                }
                _ => Vec::new(),
            }
        } else {
            tracing::info!("Using command {:?}", config.default_command);
            config.default_command.clone()
        };

        let default_usable = default_command.first().is_some_and(|p| !p.is_empty());
        if !default_usable && (!config.allow_remote_command || config.remote_command_as_args) {
            return Err(ConfigError::Invalid(
                "No default command and no login shell; remote commands must be enabled \
                 and not used as arguments"
                    .to_string(),
            ));
        }

        if !config.allow_all && allowed_identities.is_empty() {
            tracing::warn!("No allowed identities configured, no connections will be accepted");
        }

        Ok(Self {
            allow_all: config.allow_all,
            allowed_identities,
            allow_remote_command: config.allow_remote_command,
            remote_command_as_args: config.remote_command_as_args,
            default_command: default_command.into(),
            timeouts: config.timeouts.clone(),
        })
    }

    /// Authentication gate
    pub fn is_allowed(&self, identity: &IdentityHash) -> bool {
        self.allow_all || self.allowed_identities.contains(identity)
    }

    /// Effective command line for a request
    pub fn resolve_command(&self, remote: &[String]) -> Result<Vec<String>, SessionError> {
        if remote.is_empty() {
            return Ok(self.default_command.to_vec());
        }
        if !self.allow_remote_command {
            return Err(SessionError::RemoteCommandNotAllowed);
        }
        if self.remote_command_as_args {
            let mut cmdline = self.default_command.to_vec();
            cmdline.extend_from_slice(remote);
            Ok(cmdline)
        } else {
            Ok(remote.to_vec())
        }
    }
}

/// Shared collaborators of every session
pub struct ListenerContext {
    /// Policy
    pub policy: ListenerPolicy,
    /// Reliable message delivery
    pub messenger: Box<dyn Messenger>,
    /// Child process factory
    pub spawner: Arc<dyn ProcessSpawner>,
    events: EventSender,
}

impl ListenerContext {
    pub fn new(
        policy: ListenerPolicy,
        messenger: Box<dyn Messenger>,
        spawner: Arc<dyn ProcessSpawner>,
        events: EventSender,
    ) -> Self {
        Self {
            policy,
            messenger,
            spawner,
            events,
        }
    }

    /// Output sink routing a child's output back to `link`'s session
    pub fn output_sink(&self, link: LinkId) -> Arc<dyn OutputSink> {
        Arc::new(ChannelSink::new(link, self.events.clone()))
    }
}
