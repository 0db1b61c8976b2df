//! Terminal-mode children on a portable-pty pseudo-terminal

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use msh_core::error::ProcessError;
use msh_core::traits::{CommandSpec, OutputSink, ProcessHandle, ProcessOutput};
use msh_protocol::WindowSize;

use super::{spawn_error, READER_JOIN_TIMEOUT, READ_CHUNK};

fn pty_size(window: WindowSize) -> PtySize {
    let window = if window.is_empty() {
        WindowSize::new(24, 80)
    } else {
        window
    };
    PtySize {
        rows: window.rows,
        cols: window.cols,
        pixel_width: window.hpix,
        pixel_height: window.vpix,
    }
}

fn terminal_error(e: impl ToString) -> ProcessError {
    ProcessError::Terminal(e.to_string())
}

/// Child attached to a pseudo-terminal
///
/// stdout and stderr share the terminal, so all output is reported as
/// stdout and both streams reach EOF together.
pub struct PtyProcess {
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    running: Arc<AtomicBool>,
}

impl PtyProcess {
    pub(super) fn spawn(spec: &CommandSpec, sink: Arc<dyn OutputSink>) -> Result<Self, ProcessError> {
        let pair = native_pty_system()
            .openpty(pty_size(spec.window))
            .map_err(terminal_error)?;

        let mut cmd = CommandBuilder::new(&spec.argv[0]);
        cmd.args(&spec.argv[1..]);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_error(spec, e))?;
        // The child holds its own copy; ours would keep the reader from seeing EOF
        drop(pair.slave);

        let pid = child.process_id();
        tracing::info!("Started {:?} on a pty with pid {:?}", spec.argv, pid);

        let reader = pair.master.try_clone_reader().map_err(terminal_error)?;
        let writer = pair.master.take_writer().map_err(terminal_error)?;
        let killer = child.clone_killer();
        let running = Arc::new(AtomicBool::new(true));

        let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>();
        thread::Builder::new()
            .name(format!("pty-writer-{}", pid.unwrap_or_default()))
            .spawn(move || feed_stdin(writer, stdin_rx))?;

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let reader_sink = Arc::clone(&sink);
        thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || {
                read_terminal(reader, reader_sink.as_ref());
                let _ = done_tx.send(());
            })?;

        let waiter_running = Arc::clone(&running);
        thread::Builder::new()
            .name(format!("pty-waiter-{}", pid.unwrap_or_default()))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.exit_code() as i32,
                    Err(e) => {
                        tracing::warn!("Failed to wait for pid {:?}: {}", pid, e);
                        255
                    }
                };
                if done_rx.recv_timeout(READER_JOIN_TIMEOUT).is_err() {
                    tracing::debug!("Terminal of pid {:?} still open at exit", pid);
                }
                waiter_running.store(false, Ordering::SeqCst);
                sink.deliver(ProcessOutput::Exited(code));
            })?;

        Ok(Self {
            pid,
            master: pair.master,
            stdin: Some(stdin_tx),
            killer,
            running,
        })
    }
}

/// Dropping the writer at the end sends the terminal's EOF character
fn feed_stdin(mut writer: Box<dyn Write + Send>, rx: mpsc::Receiver<Vec<u8>>) {
    for data in rx {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            tracing::debug!("Terminal write failed: {}", e);
            return;
        }
    }
}

fn read_terminal(mut reader: Box<dyn Read + Send>, sink: &dyn OutputSink) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => sink.deliver(ProcessOutput::Stdout(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the last slave descriptor closes
            Err(e) => {
                tracing::trace!("Terminal read ended: {}", e);
                break;
            }
        }
    }
    sink.deliver(ProcessOutput::StdoutEof);
    sink.deliver(ProcessOutput::StderrEof);
}

impl ProcessHandle for PtyProcess {
    fn write(&mut self, data: &[u8]) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_ref().ok_or(ProcessError::StdinClosed)?;
        stdin
            .send(data.to_vec())
            .map_err(|_| ProcessError::StdinClosed)
    }

    fn close_stdin(&mut self) -> Result<(), ProcessError> {
        if self.stdin.take().is_some() {
            tracing::debug!("Closed terminal input of pid {:?}", self.pid);
        }
        Ok(())
    }

    fn set_window_size(&mut self, size: WindowSize) -> Result<(), ProcessError> {
        if size.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            "Resizing terminal of pid {:?} to {}x{}",
            self.pid,
            size.cols,
            size.rows
        );
        self.master.resize(pty_size(size)).map_err(terminal_error)
    }

    fn terminate(&mut self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning);
        }
        self.killer.kill()?;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.killer.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_gets_default_geometry() {
        let size = pty_size(WindowSize::default());
        assert_eq!((size.rows, size.cols), (24, 80));

        let size = pty_size(WindowSize::new(50, 132).with_pixels(1000, 800));
        assert_eq!(
            (size.rows, size.cols, size.pixel_width, size.pixel_height),
            (50, 132, 1000, 800)
        );
    }
}
