//! In-memory fakes for session tests

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use msh_core::error::{OutletError, ProcessError};
use msh_core::MshError;
use msh_core::traits::{
    CommandSpec, Outlet, OutputSink, ProcessHandle, ProcessSpawner, Receipt, ReceiptState,
};
use msh_protocol::{packet, LinkId, Message, ProtocolError, WindowSize};

use crate::messenger::{Messenger, RetryingMessenger};

/// Observable state of a [`MockOutlet`]
pub struct OutletState {
    pub sent: Vec<Bytes>,
    pub mdu: usize,
    pub rtt: Duration,
    pub usable: bool,
    pub packets_enabled: bool,
    pub link_closed_enabled: bool,
    pub teardowns: usize,
    pub timed_out: bool,
    pub fail_sends: bool,
    pub default_receipt: ReceiptState,
}

impl Default for OutletState {
    fn default() -> Self {
        Self {
            sent: Vec::new(),
            mdu: 431,
            rtt: Duration::from_millis(100),
            usable: true,
            packets_enabled: false,
            link_closed_enabled: true,
            teardowns: 0,
            timed_out: false,
            fail_sends: false,
            default_receipt: ReceiptState::Delivered,
        }
    }
}

impl OutletState {
    /// Decode everything sent so far
    pub fn messages(&self) -> Vec<Message> {
        self.sent
            .iter()
            .map(|raw| packet::decode(raw).unwrap())
            .collect()
    }
}

pub struct MockOutlet {
    link: LinkId,
    state: Arc<Mutex<OutletState>>,
}

impl MockOutlet {
    pub fn new(link: LinkId) -> (Self, Arc<Mutex<OutletState>>) {
        let state = Arc::new(Mutex::new(OutletState::default()));
        (
            Self {
                link,
                state: Arc::clone(&state),
            },
            state,
        )
    }
}

impl Outlet for MockOutlet {
    fn link_id(&self) -> LinkId {
        self.link
    }

    fn mdu(&self) -> usize {
        self.state.lock().unwrap().mdu
    }

    fn rtt(&self) -> Duration {
        self.state.lock().unwrap().rtt
    }

    fn send(&mut self, raw: Bytes) -> Result<Receipt, OutletError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_sends {
            return Err(OutletError::Closed);
        }
        state.sent.push(raw);
        Ok(Receipt(state.sent.len() as u64))
    }

    fn receipt_state(&self, _receipt: Receipt) -> ReceiptState {
        self.state.lock().unwrap().default_receipt
    }

    fn enable_packets(&mut self) {
        self.state.lock().unwrap().packets_enabled = true;
    }

    fn disable_link_closed(&mut self) {
        self.state.lock().unwrap().link_closed_enabled = false;
    }

    fn is_usable(&self) -> bool {
        self.state.lock().unwrap().usable
    }

    fn teardown(&mut self) -> Result<(), OutletError> {
        let mut state = self.state.lock().unwrap();
        state.teardowns += 1;
        state.usable = false;
        Ok(())
    }

    fn timed_out(&mut self) {
        self.state.lock().unwrap().timed_out = true;
    }
}

/// Observable state of a process started by [`MockSpawner`]
#[derive(Default)]
pub struct ProcessState {
    pub spec: CommandSpec,
    pub stdin: Vec<u8>,
    pub stdin_closes: usize,
    pub windows: Vec<WindowSize>,
    pub terminated: bool,
    pub running: bool,
}

#[derive(Default)]
pub struct SpawnerState {
    pub processes: Vec<Arc<Mutex<ProcessState>>>,
    pub sinks: Vec<Arc<dyn OutputSink>>,
    pub fail: bool,
}

/// Spawner recording every spawn request
#[derive(Clone, Default)]
pub struct MockSpawner {
    pub state: Arc<Mutex<SpawnerState>>,
}

impl MockSpawner {
    pub fn process(&self, index: usize) -> Arc<Mutex<ProcessState>> {
        Arc::clone(&self.state.lock().unwrap().processes[index])
    }

    pub fn spawned(&self) -> usize {
        self.state.lock().unwrap().processes.len()
    }
}

struct MockProcess {
    state: Arc<Mutex<ProcessState>>,
}

impl ProcessHandle for MockProcess {
    fn write(&mut self, data: &[u8]) -> Result<(), ProcessError> {
        self.state.lock().unwrap().stdin.extend_from_slice(data);
        Ok(())
    }

    fn close_stdin(&mut self) -> Result<(), ProcessError> {
        self.state.lock().unwrap().stdin_closes += 1;
        Ok(())
    }

    fn set_window_size(&mut self, size: WindowSize) -> Result<(), ProcessError> {
        self.state.lock().unwrap().windows.push(size);
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), ProcessError> {
        let mut state = self.state.lock().unwrap();
        state.terminated = true;
        state.running = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

impl ProcessSpawner for MockSpawner {
    fn spawn(
        &self,
        spec: CommandSpec,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Box<dyn ProcessHandle>, ProcessError> {
        let mut spawner = self.state.lock().unwrap();
        if spawner.fail {
            return Err(ProcessError::Spawn {
                program: spec.program().unwrap_or_default().to_string(),
                reason: "mock failure".to_string(),
            });
        }
        let state = Arc::new(Mutex::new(ProcessState {
            spec,
            running: true,
            ..Default::default()
        }));
        spawner.processes.push(Arc::clone(&state));
        spawner.sinks.push(sink);
        Ok(Box::new(MockProcess { state }))
    }
}

/// A [`RetryingMessenger`] the test keeps a handle on after boxing it
#[derive(Clone, Default)]
pub struct SharedMessenger(pub Arc<Mutex<RetryingMessenger>>);

impl SharedMessenger {
    pub fn in_flight(&self, link: LinkId) -> usize {
        self.0.lock().unwrap().in_flight(link)
    }
}

impl Messenger for SharedMessenger {
    fn send(&mut self, outlet: &mut dyn Outlet, message: &Message) -> Result<(), MshError> {
        self.0.lock().unwrap().send(outlet, message)
    }

    fn receive(&self, raw: &[u8]) -> Result<Message, ProtocolError> {
        self.0.lock().unwrap().receive(raw)
    }

    fn is_outlet_ready(&self, outlet: &dyn Outlet) -> bool {
        self.0.lock().unwrap().is_outlet_ready(outlet)
    }

    fn clear_retries(&mut self, outlet: &dyn Outlet) {
        self.0.lock().unwrap().clear_retries(outlet)
    }

    fn service(&mut self, outlet: &mut dyn Outlet, now: Instant) {
        self.0.lock().unwrap().service(outlet, now)
    }
}
