//! Pipe-mode children on tokio::process

use bytes::Bytes;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use msh_core::error::ProcessError;
use msh_core::traits::{CommandSpec, OutputSink, ProcessHandle, ProcessOutput};
use msh_protocol::WindowSize;

use super::{exit_code, spawn_error, READER_JOIN_TIMEOUT, READ_CHUNK};

/// Child whose stdin, stdout and stderr are plain pipes
pub struct PipeProcess {
    pid: Option<u32>,
    stdin: Option<mpsc::UnboundedSender<Vec<u8>>>,
    kill: CancellationToken,
    running: Arc<AtomicBool>,
}

impl PipeProcess {
    pub(super) fn spawn(spec: &CommandSpec, sink: Arc<dyn OutputSink>) -> Result<Self, ProcessError> {
        let mut child = Command::new(&spec.argv[0])
            .args(&spec.argv[1..])
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(spec, e))?;

        let pid = child.id();
        tracing::info!("Started {:?} with pid {:?}", spec.argv, pid);

        let stdin = child.stdin.take().map(|stdin| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(feed_stdin(stdin, rx));
            tx
        });

        let stdout = child.stdout.take().map(|stdout| {
            tokio::spawn(read_stream(
                stdout,
                Arc::clone(&sink),
                ProcessOutput::Stdout,
                ProcessOutput::StdoutEof,
            ))
        });
        let stderr = child.stderr.take().map(|stderr| {
            tokio::spawn(read_stream(
                stderr,
                Arc::clone(&sink),
                ProcessOutput::Stderr,
                ProcessOutput::StderrEof,
            ))
        });

        let kill = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));

        let supervisor_kill = kill.clone();
        let supervisor_running = Arc::clone(&running);
        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = supervisor_kill.cancelled() => None,
            };

            let status = match exited {
                Some(status) => status,
                None => {
                    tracing::debug!("Killing pid {:?}", pid);
                    if let Err(e) = child.start_kill() {
                        tracing::warn!("Failed to kill pid {:?}: {}", pid, e);
                    }
                    child.wait().await
                }
            };

            let readers = async {
                for reader in [stdout, stderr].into_iter().flatten() {
                    let _ = reader.await;
                }
            };
            if tokio::time::timeout(READER_JOIN_TIMEOUT, readers).await.is_err() {
                tracing::debug!("Output readers of pid {:?} still open at exit", pid);
            }

            supervisor_running.store(false, Ordering::SeqCst);
            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!("Failed to wait for pid {:?}: {}", pid, e);
                    255
                }
            };
            sink.deliver(ProcessOutput::Exited(code));
        });

        Ok(Self {
            pid,
            stdin,
            kill,
            running,
        })
    }
}

async fn feed_stdin(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            tracing::debug!("Child stdin write failed: {}", e);
            return;
        }
        if let Err(e) = stdin.flush().await {
            tracing::debug!("Child stdin flush failed: {}", e);
            return;
        }
    }
}

async fn read_stream<R>(
    mut reader: R,
    sink: Arc<dyn OutputSink>,
    data: fn(Bytes) -> ProcessOutput,
    eof: ProcessOutput,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.deliver(data(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) => {
                tracing::debug!("Child output read failed: {}", e);
                break;
            }
        }
    }
    sink.deliver(eof);
}

impl ProcessHandle for PipeProcess {
    fn write(&mut self, data: &[u8]) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_ref().ok_or(ProcessError::StdinClosed)?;
        stdin
            .send(data.to_vec())
            .map_err(|_| ProcessError::StdinClosed)
    }

    fn close_stdin(&mut self) -> Result<(), ProcessError> {
        if self.stdin.take().is_some() {
            tracing::debug!("Closed stdin of pid {:?}", self.pid);
        }
        Ok(())
    }

    fn set_window_size(&mut self, _size: WindowSize) -> Result<(), ProcessError> {
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), ProcessError> {
        if !self.is_running() {
            return Err(ProcessError::NotRunning);
        }
        self.kill.cancel();
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for PipeProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}
