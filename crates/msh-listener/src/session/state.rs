//! Session state machine states

use std::fmt;

/// Lifecycle of a listener session
///
/// The normal path is `WaitIdent -> WaitVersion -> WaitCommand -> Running`.
/// Any state may move to `Error`, which always ends in `Teardown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Waiting for the link to confirm the initiator's identity
    WaitIdent,
    /// Waiting for the initiator's version announcement
    WaitVersion,
    /// Waiting for the command request
    WaitCommand,
    /// Child process running, streams flowing
    Running,
    /// Terminated, waiting to be pruned
    Error,
    /// Removed from the registry, link torn down
    Teardown,
}

impl SessionState {
    /// Name used in protocol error and timeout reasons
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::WaitIdent => "WAIT_IDENT",
            SessionState::WaitVersion => "WAIT_VERS",
            SessionState::WaitCommand => "WAIT_CMD",
            SessionState::Running => "RUNNING",
            SessionState::Error => "ERROR",
            SessionState::Teardown => "TEARDOWN",
        }
    }

    /// Handshake states supervised by a protocol watchdog
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            SessionState::WaitIdent | SessionState::WaitVersion | SessionState::WaitCommand
        )
    }

    /// Session has been terminated
    pub fn is_terminated(&self) -> bool {
        matches!(self, SessionState::Error | SessionState::Teardown)
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (WaitIdent, WaitVersion)
                | (WaitVersion, WaitCommand)
                | (WaitCommand, Running)
                | (WaitIdent | WaitVersion | WaitCommand | Running, Error)
                | (Error, Teardown)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
