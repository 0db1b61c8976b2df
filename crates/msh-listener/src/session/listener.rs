//! Listener session state machine

use bytes::{Buf, Bytes, BytesMut};
use std::time::Instant;

use msh_core::error::SessionError;
use msh_core::traits::{CommandSpec, Outlet, ProcessHandle, ProcessOutput};
use msh_core::IdentityHash;
use msh_protocol::{
    ErrorMessage, ExecuteCommand, LinkId, Message, StreamData, StreamId, VersionInfo, WindowSize,
    PROTOCOL_VERSION,
};

use super::{SessionState, TimerKind, TimerQueue};
use crate::context::{ListenerContext, REMOTE_IDENTITY_ENV};

/// Bytes of the MDU kept free for message framing
const CHUNK_RESERVE: usize = 16;

/// Collaborators a session needs while handling one event
pub(crate) struct SessionEnv<'a> {
    pub ctx: &'a mut ListenerContext,
    pub timers: &'a mut TimerQueue,
    pub now: Instant,
}

/// Buffered output of one child stream
#[derive(Debug, Default)]
struct OutputBuffer {
    buf: BytesMut,
    /// The process reported end of stream
    eof: bool,
    /// A chunk carrying the EOF flag was sent
    eof_sent: bool,
}

impl OutputBuffer {
    fn is_pending(&self) -> bool {
        !self.buf.is_empty() || (self.eof && !self.eof_sent)
    }

    /// Next chunk of at most `max` bytes and whether it ends the stream.
    /// Nothing is consumed until [`OutputBuffer::commit`].
    fn peek(&self, max: usize) -> (Bytes, bool) {
        let len = max.min(self.buf.len());
        let eof = self.eof && !self.eof_sent && len == self.buf.len();
        (Bytes::copy_from_slice(&self.buf[..len]), eof)
    }

    fn commit(&mut self, len: usize, eof: bool) {
        self.buf.advance(len);
        self.eof_sent |= eof;
    }
}

/// One listener session, bound to a single link
pub struct ListenerSession {
    link: LinkId,
    state: SessionState,
    outlet: Box<dyn Outlet>,
    remote_identity: Option<IdentityHash>,

    cmdline: Vec<String>,
    pipe_stdin: bool,
    pipe_stdout: bool,
    pipe_stderr: bool,
    tcflags: Option<Vec<u8>>,
    term: Option<String>,
    window: WindowSize,

    stdout: OutputBuffer,
    stderr: OutputBuffer,
    return_code: Option<i32>,
    return_code_sent: bool,

    process: Option<Box<dyn ProcessHandle>>,
    stdin_closed: bool,
}

impl ListenerSession {
    /// Create a session for a freshly accepted link
    pub(crate) fn new(outlet: Box<dyn Outlet>, env: &mut SessionEnv<'_>) -> Self {
        let mut session = Self {
            link: outlet.link_id(),
            state: SessionState::WaitIdent,
            outlet,
            remote_identity: None,
            cmdline: Vec::new(),
            pipe_stdin: false,
            pipe_stdout: false,
            pipe_stderr: false,
            tcflags: None,
            term: None,
            window: WindowSize::default(),
            stdout: OutputBuffer::default(),
            stderr: OutputBuffer::default(),
            return_code: None,
            return_code_sent: false,
            process: None,
            stdin_closed: false,
        };
        tracing::info!("Session created on {}", session.link);
        session.arm_watchdog(env);
        session
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn remote_identity(&self) -> Option<&IdentityHash> {
        self.remote_identity.as_ref()
    }

    /// Effective command line, set once the command request was accepted
    pub fn cmdline(&self) -> &[String] {
        &self.cmdline
    }

    /// Pipe flags of the command request as `(stdin, stdout, stderr)`
    pub fn pipes(&self) -> (bool, bool, bool) {
        (self.pipe_stdin, self.pipe_stdout, self.pipe_stderr)
    }

    /// Terminal attributes supplied by the initiator
    pub fn tcflags(&self) -> Option<&[u8]> {
        self.tcflags.as_deref()
    }

    pub fn window(&self) -> WindowSize {
        self.window
    }

    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    /// Output bytes buffered and not yet sent, as `(stdout, stderr)`
    pub fn buffered(&self) -> (usize, usize) {
        (self.stdout.buf.len(), self.stderr.buf.len())
    }

    fn transition(&mut self, next: SessionState, env: &mut SessionEnv<'_>) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {} -> {}",
            self.state,
            next
        );
        self.state = next;
        self.arm_watchdog(env);
    }

    /// Handshake states get a watchdog; `Running` is open-ended and is
    /// supervised only once the exit code has been sent.
    fn arm_watchdog(&mut self, env: &mut SessionEnv<'_>) {
        if !self.state.is_handshake() {
            tracing::debug!("{}: state {}", self.link, self.state);
            return;
        }
        let timeout = env.ctx.policy.timeouts.protocol_timeout(self.outlet.rtt());
        tracing::debug!("{}: state {}, timeout {:?}", self.link, self.state, timeout);
        env.timers.schedule_after(
            self.link,
            TimerKind::Watchdog { armed: self.state },
            env.now,
            timeout,
        );
    }

    fn send(&mut self, message: &Message, env: &mut SessionEnv<'_>) -> bool {
        match env.ctx.messenger.send(&mut *self.outlet, message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("{}: failed to send {}: {}", self.link, message.name(), e);
                false
            }
        }
    }

    fn fail(&mut self, error: SessionError, env: &mut SessionEnv<'_>) {
        self.terminate(Some(&error.to_string()), env);
    }

    /// End the session
    ///
    /// With a reason, a fatal error message is sent to the peer first. The
    /// child is killed and pruning is scheduled. Has no effect once the
    /// session is already terminated.
    pub(crate) fn terminate(&mut self, reason: Option<&str>, env: &mut SessionEnv<'_>) {
        if self.state.is_terminated() {
            return;
        }

        match reason {
            Some(reason) => {
                tracing::info!("Terminating session on {}: {}", self.link, reason);
                self.send(&Message::Error(ErrorMessage::fatal(reason)), env);
            }
            None => tracing::info!("Terminating session on {}", self.link),
        }

        self.transition(SessionState::Error, env);
        self.kill_process();

        let delay = env.ctx.policy.timeouts.prune_delay(self.outlet.rtt());
        env.timers.schedule_after(self.link, TimerKind::Prune, env.now, delay);
    }

    fn kill_process(&mut self) {
        if let Some(process) = self.process.as_mut() {
            if process.is_running() {
                if let Err(e) = process.terminate() {
                    tracing::warn!("{}: failed to kill process: {}", self.link, e);
                }
            }
        }
    }

    /// Remove the link; the registry drops the session afterwards
    pub(crate) fn prune(&mut self, env: &mut SessionEnv<'_>) {
        if self.state != SessionState::Error {
            return;
        }
        self.state = SessionState::Teardown;
        tracing::debug!("{}: state {}", self.link, self.state);
        env.ctx.messenger.clear_retries(&*self.outlet);
        if let Err(e) = self.outlet.teardown() {
            tracing::debug!("{}: teardown failed: {}", self.link, e);
        }
    }

    /// The link confirmed the initiator's identity
    pub(crate) fn on_identity(&mut self, identity: IdentityHash, env: &mut SessionEnv<'_>) {
        if self.state.is_terminated() {
            tracing::debug!("{}: identity received in state {}", self.link, self.state);
            return;
        }

        tracing::info!("Initiator of {} identified as {}", self.link, identity);
        if self.state != SessionState::WaitIdent {
            return self.fail(
                SessionError::Protocol(SessionState::WaitIdent.name().to_string()),
                env,
            );
        }

        if !env.ctx.policy.is_allowed(&identity) {
            tracing::warn!("Identity {} not allowed on {}", identity, self.link);
            return self.fail(SessionError::IdentityNotAllowed, env);
        }

        self.remote_identity = Some(identity);
        self.outlet.enable_packets();
        self.transition(SessionState::WaitVersion, env);
    }

    /// The link went away
    pub(crate) fn on_link_closed(&mut self, env: &mut SessionEnv<'_>) {
        self.outlet.disable_link_closed();
        tracing::debug!("{}: link closed", self.link);
        env.ctx.messenger.clear_retries(&*self.outlet);
        self.terminate(None, env);
    }

    /// One raw packet arrived from the peer
    pub(crate) fn on_packet(&mut self, raw: &[u8], env: &mut SessionEnv<'_>) {
        if self.state.is_terminated() {
            tracing::debug!("{}: packet received in state {}", self.link, self.state);
            return;
        }

        match env.ctx.messenger.receive(raw) {
            Ok(message) => self.handle_message(message, env),
            Err(e) => self.fail(
                SessionError::Protocol(format!("error receiving packet: {}", e)),
                env,
            ),
        }
    }

    fn handle_message(&mut self, message: Message, env: &mut SessionEnv<'_>) {
        tracing::trace!("{}: received {} in {}", self.link, message.name(), self.state);

        match self.state {
            SessionState::WaitIdent => {
                self.fail(SessionError::Protocol("unexpected message".to_string()), env)
            }
            SessionState::WaitVersion => match message {
                Message::VersionInfo(info) => self.on_version(info, env),
                _ => self.fail(SessionError::Protocol(self.state.name().to_string()), env),
            },
            SessionState::WaitCommand => match message {
                Message::ExecuteCommand(request) => self.on_execute(request, env),
                _ => self.fail(SessionError::Protocol(self.state.name().to_string()), env),
            },
            SessionState::Running => match message {
                Message::WindowSize(size) => self.apply_window_size(size),
                Message::StreamData(chunk) if chunk.stream == StreamId::Stdin => {
                    self.on_stdin(chunk)
                }
                Message::StreamData(chunk) => {
                    tracing::error!(
                        "Received stream data for invalid stream {} on {}",
                        chunk.stream,
                        self.link
                    );
                    self.fail(SessionError::Protocol(self.state.name().to_string()), env)
                }
                Message::Noop => {
                    self.send(&Message::Noop, env);
                }
                Message::Error(error) if error.fatal => {
                    tracing::info!("Peer ended session on {}: {}", self.link, error.message);
                    self.terminate(None, env)
                }
                Message::Error(error) => {
                    tracing::warn!("Peer reported on {}: {}", self.link, error.message)
                }
                _ => self.fail(SessionError::Protocol(self.state.name().to_string()), env),
            },
            SessionState::Error | SessionState::Teardown => {}
        }
    }

    fn on_version(&mut self, info: VersionInfo, env: &mut SessionEnv<'_>) {
        tracing::info!(
            "Version {}, protocol {:#x} on {}",
            info.sw_version,
            info.protocol_version,
            self.link
        );
        if info.protocol_version != PROTOCOL_VERSION {
            return self.fail(SessionError::IncompatibleProtocol, env);
        }
        self.send(&Message::VersionInfo(VersionInfo::current()), env);
        self.transition(SessionState::WaitCommand, env);
    }

    fn on_execute(&mut self, request: ExecuteCommand, env: &mut SessionEnv<'_>) {
        tracing::info!("Execute command on {}: {:?}", self.link, request.cmdline);

        let cmdline = match env.ctx.policy.resolve_command(&request.cmdline) {
            Ok(cmdline) => cmdline,
            Err(e) => return self.fail(e, env),
        };

        self.cmdline = cmdline;
        self.pipe_stdin = request.pipe_stdin;
        self.pipe_stdout = request.pipe_stdout;
        self.pipe_stderr = request.pipe_stderr;
        self.tcflags = request.tcflags;
        self.term = request.term;
        self.transition(SessionState::Running, env);

        let spec = CommandSpec {
            argv: self.cmdline.clone(),
            env: self.child_env(),
            pipe_stdin: self.pipe_stdin,
            pipe_stdout: self.pipe_stdout,
            pipe_stderr: self.pipe_stderr,
            window: request.window,
        };

        match env.ctx.spawner.spawn(spec, env.ctx.output_sink(self.link)) {
            Ok(process) => {
                self.process = Some(process);
                self.apply_window_size(request.window);
            }
            Err(e) => {
                tracing::error!("Unable to start process for {}: {}", self.link, e);
                self.fail(SessionError::ProcessStart, env);
            }
        }
    }

    fn child_env(&self) -> Vec<(String, String)> {
        let mut vars = Vec::with_capacity(2);
        if let Some(term) = self
            .term
            .clone()
            .or_else(|| std::env::var("TERM").ok())
        {
            vars.push(("TERM".to_string(), term));
        }
        vars.push((
            REMOTE_IDENTITY_ENV.to_string(),
            self.remote_identity
                .map(|id| id.pretty())
                .unwrap_or_default(),
        ));
        vars
    }

    fn apply_window_size(&mut self, size: WindowSize) {
        self.window = size;
        if size.is_empty() {
            return;
        }
        if let Some(process) = self.process.as_mut() {
            if let Err(e) = process.set_window_size(size) {
                tracing::debug!("{}: resize failed: {}", self.link, e);
            }
        }
    }

    fn on_stdin(&mut self, chunk: StreamData) {
        let Some(process) = self.process.as_mut() else {
            return;
        };

        if !chunk.data.is_empty() {
            if let Err(e) = process.write(&chunk.data) {
                tracing::warn!("{}: stdin write failed: {}", self.link, e);
            }
        }

        if chunk.eof && !self.stdin_closed {
            self.stdin_closed = true;
            if let Err(e) = process.close_stdin() {
                tracing::debug!("{}: closing stdin failed: {}", self.link, e);
            }
        }
    }

    /// Output or exit reported by the child
    pub(crate) fn on_process_output(&mut self, output: ProcessOutput) {
        if self.state.is_terminated() {
            return;
        }

        match output {
            ProcessOutput::Stdout(data) => self.stdout.buf.extend_from_slice(&data),
            ProcessOutput::Stderr(data) => self.stderr.buf.extend_from_slice(&data),
            ProcessOutput::StdoutEof => self.stdout.eof = true,
            ProcessOutput::StderrEof => self.stderr.eof = true,
            ProcessOutput::Exited(code) => {
                tracing::info!("Process on {} exited with code {}", self.link, code);
                self.return_code.get_or_insert(code);
            }
        }
    }

    /// Send at most one message: stderr first, then stdout, then the exit
    /// code. Returns whether anything was sent.
    pub(crate) fn pump(&mut self, env: &mut SessionEnv<'_>) -> bool {
        if self.state != SessionState::Running {
            return false;
        }
        if !env.ctx.messenger.is_outlet_ready(&*self.outlet) {
            return false;
        }

        let chunk_size = self.outlet.mdu().saturating_sub(CHUNK_RESERVE);
        if chunk_size == 0 {
            return false;
        }

        if self.stderr.is_pending() {
            return self.send_chunk(StreamId::Stderr, chunk_size, env);
        }
        if self.stdout.is_pending() {
            return self.send_chunk(StreamId::Stdout, chunk_size, env);
        }

        if let (Some(return_code), false) = (self.return_code, self.return_code_sent) {
            if !self.send(&Message::CommandExited { return_code }, env) {
                return false;
            }
            self.return_code_sent = true;

            let timeout = env.ctx.policy.timeouts.exit_timeout(self.outlet.rtt());
            env.timers.schedule_after(self.link, TimerKind::ExitWatchdog, env.now, timeout);
            return true;
        }

        false
    }

    fn send_chunk(&mut self, stream: StreamId, max: usize, env: &mut SessionEnv<'_>) -> bool {
        let (data, eof) = match stream {
            StreamId::Stderr => self.stderr.peek(max),
            _ => self.stdout.peek(max),
        };
        let len = data.len();

        if !self.send(&Message::StreamData(StreamData::new(stream, data, eof)), env) {
            return false;
        }
        tracing::trace!("{}: sent {} bytes of {} (eof: {})", self.link, len, stream, eof);

        match stream {
            StreamId::Stderr => self.stderr.commit(len, eof),
            _ => self.stdout.commit(len, eof),
        }
        true
    }

    /// A timer armed by this session fired
    pub(crate) fn on_timer(&mut self, kind: TimerKind, env: &mut SessionEnv<'_>) {
        match kind {
            TimerKind::Watchdog { armed } => {
                if self.state == armed {
                    self.fail(SessionError::Timeout(armed.name().to_string()), env);
                }
            }
            TimerKind::ExitWatchdog => {
                if self.state == SessionState::Running {
                    self.fail(SessionError::Timeout("CommandExited".to_string()), env);
                }
            }
            TimerKind::Prune => self.prune(env),
        }
    }

    /// Drive the messenger's retries for this session's outlet
    pub(crate) fn service(&mut self, env: &mut SessionEnv<'_>) {
        env.ctx.messenger.service(&mut *self.outlet, env.now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ListenerPolicy;
    use crate::event::{self, EventReceiver};
    use crate::messenger::{Messenger, RetryingMessenger};
    use crate::testing::{MockOutlet, MockSpawner, OutletState, SharedMessenger};
    use msh_core::config::ListenerConfig;
    use msh_core::traits::ReceiptState;
    use msh_protocol::packet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const PEER: [u8; 16] = [0xAB; 16];

    macro_rules! session_env {
        ($h:expr) => {
            &mut SessionEnv {
                ctx: &mut $h.ctx,
                timers: &mut $h.timers,
                now: $h.now,
            }
        };
    }

    struct Harness {
        ctx: ListenerContext,
        timers: TimerQueue,
        spawner: MockSpawner,
        outlet: Arc<Mutex<OutletState>>,
        session: ListenerSession,
        now: Instant,
        _events: EventReceiver,
    }

    impl Harness {
        fn new(config: ListenerConfig) -> Self {
            Self::with_messenger(config, Box::new(RetryingMessenger::default()))
        }

        fn with_messenger(config: ListenerConfig, messenger: Box<dyn Messenger>) -> Self {
            let policy = ListenerPolicy::from_config(&config).unwrap();
            let spawner = MockSpawner::default();
            let (tx, rx) = event::channel();
            let mut ctx = ListenerContext::new(
                policy,
                messenger,
                Arc::new(spawner.clone()),
                tx,
            );
            let mut timers = TimerQueue::new();
            let (outlet, state) = MockOutlet::new(LinkId(1));
            let now = Instant::now();
            let session = ListenerSession::new(
                Box::new(outlet),
                &mut SessionEnv {
                    ctx: &mut ctx,
                    timers: &mut timers,
                    now,
                },
            );
            Self {
                ctx,
                timers,
                spawner,
                outlet: state,
                session,
                now,
                _events: rx,
            }
        }

        fn open() -> Self {
            Self::new(ListenerConfig {
                allow_all: true,
                default_command: vec!["/bin/sh".to_string()],
                ..Default::default()
            })
        }

        fn identify(&mut self) {
            self.session.on_identity(IdentityHash::new(PEER), session_env!(self));
        }

        fn deliver(&mut self, message: Message) {
            let raw = packet::encode(&message).unwrap();
            self.session.on_packet(&raw, session_env!(self));
        }

        fn pump(&mut self) -> bool {
            self.session.pump(session_env!(self))
        }

        fn output(&mut self, output: ProcessOutput) {
            self.session.on_process_output(output);
        }

        fn running(mut self, request: ExecuteCommand) -> Self {
            self.identify();
            self.deliver(Message::VersionInfo(VersionInfo::current()));
            self.deliver(Message::ExecuteCommand(request));
            assert_eq!(self.session.state(), SessionState::Running);
            self
        }

        fn sent(&self) -> Vec<Message> {
            self.outlet.lock().unwrap().messages()
        }

        fn clear_sent(&self) {
            self.outlet.lock().unwrap().sent.clear();
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            let due = self.timers.pop_due(self.now);
            for (link, kind) in due {
                assert_eq!(link, self.session.link());
                self.session.on_timer(kind, session_env!(self));
            }
        }
    }

    fn fatal(reason: &str) -> Message {
        Message::Error(ErrorMessage::fatal(reason))
    }

    #[test]
    fn test_handshake_reaches_running() {
        let mut h = Harness::open();
        assert_eq!(h.session.state(), SessionState::WaitIdent);

        h.identify();
        assert_eq!(h.session.state(), SessionState::WaitVersion);
        assert!(h.outlet.lock().unwrap().packets_enabled);
        assert_eq!(h.session.remote_identity(), Some(&IdentityHash::new(PEER)));

        h.deliver(Message::VersionInfo(VersionInfo::current()));
        assert_eq!(h.session.state(), SessionState::WaitCommand);
        assert_eq!(h.sent(), vec![Message::VersionInfo(VersionInfo::current())]);

        h.deliver(Message::ExecuteCommand(ExecuteCommand {
            window: WindowSize::new(24, 80),
            term: Some("vt100".to_string()),
            ..Default::default()
        }));
        assert_eq!(h.session.state(), SessionState::Running);
        assert_eq!(h.spawner.spawned(), 1);

        let process = h.spawner.process(0);
        let process = process.lock().unwrap();
        assert_eq!(process.spec.argv, vec!["/bin/sh"]);
        assert!(process
            .spec
            .env
            .contains(&("TERM".to_string(), "vt100".to_string())));
        assert!(process.spec.env.contains(&(
            REMOTE_IDENTITY_ENV.to_string(),
            IdentityHash::new(PEER).pretty()
        )));
        assert_eq!(process.windows, vec![WindowSize::new(24, 80)]);
    }

    #[test]
    fn test_disallowed_identity_rejected_before_version_exchange() {
        let mut h = Harness::new(ListenerConfig {
            default_command: vec!["/bin/sh".to_string()],
            allowed_identities: vec!["0123456789abcdef0123456789abcdef".to_string()],
            ..Default::default()
        });

        h.identify();

        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.sent(), vec![fatal("Identity is not allowed.")]);
        assert!(h.session.remote_identity().is_none());
        assert!(!h.outlet.lock().unwrap().packets_enabled);
    }

    #[test]
    fn test_incompatible_protocol() {
        let mut h = Harness::open();
        h.identify();

        h.deliver(Message::VersionInfo(VersionInfo {
            sw_version: "0.0.1".to_string(),
            protocol_version: msh_protocol::message::make_protocol_version(99),
        }));
        h.deliver(Message::ExecuteCommand(ExecuteCommand::default()));

        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.sent(), vec![fatal("Incompatible protocol")]);
        assert_eq!(h.spawner.spawned(), 0);
    }

    #[test]
    fn test_unexpected_message_is_protocol_error() {
        let mut h = Harness::open();
        h.identify();
        h.deliver(Message::Noop);

        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.sent(), vec![fatal("Protocol error (WAIT_VERS)")]);
    }

    #[test]
    fn test_garbage_packet_is_protocol_error() {
        let mut h = Harness::open();
        h.identify();
        h.session.on_packet(&[0x42, 1, 2], session_env!(h));

        assert_eq!(h.session.state(), SessionState::Error);
        match &h.sent()[0] {
            Message::Error(e) => assert!(e.message.starts_with("Protocol error (error receiving packet")),
            other => panic!("Expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_second_identity_is_protocol_error() {
        let mut h = Harness::open();
        h.identify();
        h.identify();
        assert_eq!(h.sent(), vec![fatal("Protocol error (WAIT_IDENT)")]);
    }

    #[test]
    fn test_empty_remote_command_runs_default() {
        let h = Harness::open().running(ExecuteCommand::default());
        assert_eq!(h.session.cmdline(), &["/bin/sh"]);
        assert_eq!(h.spawner.process(0).lock().unwrap().spec.argv, vec!["/bin/sh"]);
    }

    #[test]
    fn test_remote_command_rejected() {
        let mut h = Harness::open();
        h.identify();
        h.deliver(Message::VersionInfo(VersionInfo::current()));
        h.clear_sent();
        h.deliver(Message::ExecuteCommand(ExecuteCommand {
            cmdline: vec!["rm".to_string(), "-rf".to_string()],
            ..Default::default()
        }));

        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(
            h.sent(),
            vec![fatal("Remote command line not allowed by listener")]
        );
        assert_eq!(h.spawner.spawned(), 0);
    }

    #[test]
    fn test_spawn_failure_reason_is_generic() {
        let mut h = Harness::open();
        h.spawner.state.lock().unwrap().fail = true;
        h.identify();
        h.deliver(Message::VersionInfo(VersionInfo::current()));
        h.clear_sent();
        h.deliver(Message::ExecuteCommand(ExecuteCommand::default()));

        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.sent(), vec![fatal("Unable to start process")]);
    }

    #[test]
    fn test_stdin_forwarded_and_closed_once() {
        let mut h = Harness::open().running(ExecuteCommand::default());

        h.deliver(Message::StreamData(StreamData::new(StreamId::Stdin, &b"abc"[..], false)));
        h.deliver(Message::StreamData(StreamData::new(StreamId::Stdin, &b"def"[..], true)));
        h.deliver(Message::StreamData(StreamData::new(StreamId::Stdin, Bytes::new(), true)));

        let process = h.spawner.process(0);
        let process = process.lock().unwrap();
        assert_eq!(process.stdin, b"abcdef");
        assert_eq!(process.stdin_closes, 1);
    }

    #[test]
    fn test_stream_data_on_output_stream_is_protocol_error() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();
        h.deliver(Message::StreamData(StreamData::new(StreamId::Stdout, &b"x"[..], false)));

        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.sent(), vec![fatal("Protocol error (RUNNING)")]);
        assert!(h.spawner.process(0).lock().unwrap().terminated);
    }

    #[test]
    fn test_noop_echoed_and_window_resized() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();

        h.deliver(Message::Noop);
        h.deliver(Message::WindowSize(WindowSize::new(50, 132)));
        h.deliver(Message::WindowSize(WindowSize::default()));

        assert_eq!(h.sent(), vec![Message::Noop]);
        assert_eq!(h.session.window(), WindowSize::default());
        assert_eq!(
            h.spawner.process(0).lock().unwrap().windows,
            vec![WindowSize::new(50, 132)]
        );
    }

    #[test]
    fn test_fatal_peer_error_ends_session_without_reply() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();

        h.deliver(Message::Error(ErrorMessage {
            message: "just a warning".to_string(),
            fatal: false,
        }));
        assert_eq!(h.session.state(), SessionState::Running);

        h.deliver(fatal("bye"));
        assert_eq!(h.session.state(), SessionState::Error);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_pump_chunks_stdout_with_eof_on_last() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.outlet.lock().unwrap().mdu = 256;
        h.clear_sent();

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        h.output(ProcessOutput::Stdout(Bytes::from(payload.clone())));
        h.output(ProcessOutput::StdoutEof);

        let mut sends = 0;
        while h.pump() {
            sends += 1;
            assert!(sends <= 100, "pump never drained");
        }

        let chunks: Vec<StreamData> = h
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::StreamData(chunk) => Some(chunk),
                _ => None,
            })
            .collect();
        assert_eq!(chunks.len(), 42);
        assert!(chunks.iter().all(|c| c.stream == StreamId::Stdout));
        assert!(chunks.iter().all(|c| c.data.len() <= 240));
        assert!(chunks[..41].iter().all(|c| !c.eof));
        assert!(chunks[41].eof);

        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.data.to_vec()).collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn test_pump_prefers_stderr_and_sends_one_message_per_call() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();

        h.output(ProcessOutput::Stdout(Bytes::from_static(b"out")));
        h.output(ProcessOutput::Stderr(Bytes::from_static(b"err")));

        assert!(h.pump());
        assert_eq!(h.sent().len(), 1);
        assert_eq!(
            h.sent()[0],
            Message::StreamData(StreamData::new(StreamId::Stderr, &b"err"[..], false))
        );

        assert!(h.pump());
        assert_eq!(
            h.sent()[1],
            Message::StreamData(StreamData::new(StreamId::Stdout, &b"out"[..], false))
        );
        assert!(!h.pump());
    }

    #[test]
    fn test_eof_only_chunk_after_drain() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();

        h.output(ProcessOutput::Stdout(Bytes::from_static(b"hi")));
        assert!(h.pump());
        h.output(ProcessOutput::StdoutEof);
        assert!(h.pump());
        assert!(!h.pump());

        assert_eq!(
            h.sent(),
            vec![
                Message::StreamData(StreamData::new(StreamId::Stdout, &b"hi"[..], false)),
                Message::StreamData(StreamData::new(StreamId::Stdout, Bytes::new(), true)),
            ]
        );
    }

    #[test]
    fn test_exit_code_sent_once_after_output() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();

        h.output(ProcessOutput::Stdout(Bytes::from_static(b"done")));
        h.output(ProcessOutput::StdoutEof);
        h.output(ProcessOutput::StderrEof);
        h.output(ProcessOutput::Exited(3));
        h.output(ProcessOutput::Exited(4));

        while h.pump() {}

        let sent = h.sent();
        let exits: Vec<&Message> = sent
            .iter()
            .filter(|m| matches!(m, Message::CommandExited { .. }))
            .collect();
        assert_eq!(exits, vec![&Message::CommandExited { return_code: 3 }]);
        assert_eq!(sent.last(), Some(&Message::CommandExited { return_code: 3 }));
        assert_eq!(h.session.return_code(), Some(3));
    }

    #[test]
    fn test_pump_idle_when_outlet_not_ready() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();
        h.outlet.lock().unwrap().usable = false;
        h.output(ProcessOutput::Stdout(Bytes::from_static(b"x")));

        assert!(!h.pump());
        assert!(h.sent().is_empty());
        assert_eq!(h.session.buffered(), (1, 0));
    }

    #[test]
    fn test_failed_send_keeps_output_buffered() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.output(ProcessOutput::Stdout(Bytes::from_static(b"keep")));
        h.output(ProcessOutput::StdoutEof);

        h.outlet.lock().unwrap().fail_sends = true;
        assert!(!h.pump());
        assert_eq!(h.session.buffered(), (4, 0));

        h.outlet.lock().unwrap().fail_sends = false;
        h.clear_sent();
        assert!(h.pump());
        assert_eq!(
            h.sent(),
            vec![Message::StreamData(StreamData::new(StreamId::Stdout, &b"keep"[..], true))]
        );
    }

    #[test]
    fn test_pump_does_nothing_before_running() {
        let mut h = Harness::open();
        h.identify();
        h.output(ProcessOutput::Stdout(Bytes::from_static(b"early")));
        assert!(!h.pump());
    }

    #[test]
    fn test_watchdog_fires_when_stuck_in_wait_version() {
        let mut h = Harness::open();
        h.identify();

        h.advance(Duration::from_secs(9));
        assert_eq!(h.session.state(), SessionState::WaitVersion);

        h.advance(Duration::from_secs(1));
        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.sent(), vec![fatal("Protocol timeout error: WAIT_VERS")]);
    }

    #[test]
    fn test_watchdog_quiet_when_session_advances() {
        let mut h = Harness::open();
        h.identify();
        h.advance(Duration::from_secs(5));
        h.deliver(Message::VersionInfo(VersionInfo::current()));
        h.advance(Duration::from_secs(5));
        h.deliver(Message::ExecuteCommand(ExecuteCommand::default()));

        h.advance(Duration::from_secs(60));
        assert_eq!(h.session.state(), SessionState::Running);
    }

    #[test]
    fn test_exit_watchdog_times_out_lingering_link() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.output(ProcessOutput::Exited(0));
        assert!(h.pump());
        h.clear_sent();

        h.advance(Duration::from_secs(10));
        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(h.sent(), vec![fatal("Protocol timeout error: CommandExited")]);
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();

        h.session.terminate(Some("first"), session_env!(h));
        let timers = h.timers.len();
        h.session.terminate(Some("second"), session_env!(h));

        assert_eq!(h.sent(), vec![fatal("first")]);
        assert_eq!(h.timers.len(), timers);
        assert!(h.spawner.process(0).lock().unwrap().terminated);
    }

    #[test]
    fn test_link_closed_terminates_silently_then_prunes() {
        let mut h = Harness::open().running(ExecuteCommand::default());
        h.clear_sent();

        h.session.on_link_closed(session_env!(h));
        assert_eq!(h.session.state(), SessionState::Error);
        assert!(h.sent().is_empty());
        assert!(!h.outlet.lock().unwrap().link_closed_enabled);

        h.advance(Duration::from_secs(5));
        assert_eq!(h.session.state(), SessionState::Teardown);
        assert_eq!(h.outlet.lock().unwrap().teardowns, 1);
    }

    #[test]
    fn test_prune_drops_unconfirmed_packets() {
        let messenger = SharedMessenger::default();
        let mut h = Harness::with_messenger(
            ListenerConfig {
                allow_all: true,
                default_command: vec!["/bin/sh".to_string()],
                ..Default::default()
            },
            Box::new(messenger.clone()),
        );
        h.outlet.lock().unwrap().default_receipt = ReceiptState::Sent;
        h.identify();

        h.session.on_packet(&[0x42, 1, 2], session_env!(h));
        assert_eq!(h.session.state(), SessionState::Error);
        assert_eq!(messenger.in_flight(LinkId(1)), 1);

        h.advance(Duration::from_secs(5));
        assert_eq!(h.session.state(), SessionState::Teardown);
        assert_eq!(messenger.in_flight(LinkId(1)), 0);
    }

    #[test]
    fn test_packets_ignored_after_termination() {
        let mut h = Harness::open();
        h.identify();
        h.session.terminate(None, session_env!(h));

        h.deliver(Message::VersionInfo(VersionInfo::current()));
        assert_eq!(h.session.state(), SessionState::Error);
        assert!(h.sent().is_empty());
    }
}
