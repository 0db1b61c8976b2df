//! Child process handles
//!
//! Commands whose three streams are all pipes run under `tokio::process`
//! with separate stdout and stderr. Anything else gets a pseudo-terminal
//! from portable-pty, with stderr merged into the terminal output.
//!
//! In both modes every output reader finishes (or is given up on after
//! [`READER_JOIN_TIMEOUT`]) before the exit code is delivered, so the
//! session always sees the last output ahead of the exit.

mod pipe;
mod pty;

use std::sync::Arc;
use std::time::Duration;

use msh_core::error::ProcessError;
use msh_core::traits::{CommandSpec, OutputSink, ProcessHandle, ProcessSpawner};

pub use pipe::PipeProcess;
pub use pty::PtyProcess;

/// How long the exit notification waits for output readers to drain
pub const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Size of a single read from a child stream
const READ_CHUNK: usize = 4096;

/// Spawner for real child processes on this host
///
/// Pipes are used only when all three streams are pipes. Any terminal
/// request puts the whole child on a pty, so a requested stderr pipe is not
/// honored there: stderr arrives merged into stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSpawner;

impl NativeSpawner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessSpawner for NativeSpawner {
    fn spawn(
        &self,
        spec: CommandSpec,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        if !spec.program().is_some_and(|p| !p.is_empty()) {
            return Err(ProcessError::EmptyCommand);
        }

        if spec.all_pipes() {
            tracing::debug!("Spawning {:?} with pipes", spec.argv);
            Ok(Box::new(PipeProcess::spawn(&spec, sink)?))
        } else {
            tracing::debug!("Spawning {:?} on a pty", spec.argv);
            Ok(Box::new(PtyProcess::spawn(&spec, sink)?))
        }
    }
}

fn spawn_error(spec: &CommandSpec, reason: impl ToString) -> ProcessError {
    ProcessError::Spawn {
        program: spec.program().unwrap_or_default().to_string(),
        reason: reason.to_string(),
    }
}

/// Exit code reported for a finished child; signals map to 128 + signal
pub(crate) fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    255
}
