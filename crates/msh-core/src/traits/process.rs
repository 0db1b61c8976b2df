//! Child process traits

use bytes::Bytes;
use std::sync::Arc;

use crate::error::ProcessError;
use msh_protocol::WindowSize;

/// Everything needed to start a child process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Program and arguments
    pub argv: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Connect stdin to a pipe instead of a terminal
    pub pipe_stdin: bool,
    /// Connect stdout to a pipe instead of a terminal
    pub pipe_stdout: bool,
    /// Connect stderr to a pipe instead of a terminal
    pub pipe_stderr: bool,
    /// Initial window geometry
    pub window: WindowSize,
}

impl CommandSpec {
    /// True when no stream needs a terminal
    pub fn all_pipes(&self) -> bool {
        self.pipe_stdin && self.pipe_stdout && self.pipe_stderr
    }

    /// Program to execute
    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Output produced by a running child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    /// Bytes read from stdout
    Stdout(Bytes),
    /// Bytes read from stderr
    Stderr(Bytes),
    /// stdout reached end of stream
    StdoutEof,
    /// stderr reached end of stream
    StderrEof,
    /// The child exited with this code
    Exited(i32),
}

/// Destination for process output
///
/// Implementations are called from reader threads and must only enqueue.
pub trait OutputSink: Send + Sync {
    /// Deliver one output event
    fn deliver(&self, output: ProcessOutput);
}

/// Handle to a running child process
pub trait ProcessHandle: Send {
    /// Write bytes to the child's stdin
    fn write(&mut self, data: &[u8]) -> Result<(), ProcessError>;

    /// Close the child's stdin
    fn close_stdin(&mut self) -> Result<(), ProcessError>;

    /// Resize the child's terminal
    fn set_window_size(&mut self, size: WindowSize) -> Result<(), ProcessError>;

    /// Kill the child
    fn terminate(&mut self) -> Result<(), ProcessError>;

    /// Whether the child is still running
    fn is_running(&self) -> bool;
}

/// Starts child processes
pub trait ProcessSpawner: Send + Sync {
    /// Start `spec`, reporting its output to `sink`
    fn spawn(
        &self,
        spec: CommandSpec,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, ProcessError>;
}
