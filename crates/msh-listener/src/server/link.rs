//! One TCP link
//!
//! Each accepted connection gets a reader task (this module's
//! [`serve_link`]) and a writer task. The session side only ever sees the
//! [`TcpOutlet`]; everything arriving from the peer is posted to the
//! listener loop as a [`LinkEvent`].

use bytes::Bytes;
use std::collections::VecDeque;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use msh_core::config::ListenerConfig;
use msh_core::error::OutletError;
use msh_core::traits::{Outlet, Receipt, ReceiptState};
use msh_core::IdentityHash;
use msh_protocol::{FrameCodec, LinkFrame, LinkId};

use crate::event::{EventSender, LinkEvent, LoopEvent};

/// Floor for the probe interval
const MIN_KEEPALIVE: Duration = Duration::from_millis(100);

/// Packets held between identification and the session enabling delivery
const MAX_HELD_PACKETS: usize = 64;

/// Per-link transport settings
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Largest packet a session may send
    pub mdu: usize,
    /// Interval between RTT probes
    pub keepalive_interval: Duration,
}

impl LinkConfig {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            mdu: config.link_mdu,
            keepalive_interval: config.keepalive_interval,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::from_config(&ListenerConfig::default())
    }
}

/// State shared between the outlet and the link's I/O tasks
#[derive(Debug, Default)]
struct LinkShared {
    /// Smoothed RTT in microseconds, 0 until the first probe returns
    rtt_micros: AtomicU64,
    /// Highest packet sequence number written to the socket
    flushed: AtomicU64,
    packets_enabled: AtomicBool,
    /// Wakes the reader to release held packets
    packets_ready: Notify,
    link_closed_enabled: AtomicBool,
    closed: AtomicBool,
}

impl LinkShared {
    fn new() -> Self {
        Self {
            link_closed_enabled: AtomicBool::new(true),
            ..Default::default()
        }
    }

    fn record_rtt(&self, sample: u64) {
        let old = self.rtt_micros.load(Ordering::Relaxed);
        let smoothed = if old == 0 {
            sample
        } else {
            (old * 7 + sample) / 8
        };
        self.rtt_micros.store(smoothed.max(1), Ordering::Relaxed);
    }
}

enum Outbound {
    Packet { seq: u64, raw: Bytes },
    Control(LinkFrame),
    Close,
}

/// Session-facing end of a TCP link
///
/// TCP already retransmits, so a packet counts as delivered once it has
/// been written to the socket, and as failed if the link died first.
pub struct TcpOutlet {
    link: LinkId,
    mdu: usize,
    shared: Arc<LinkShared>,
    tx: mpsc::UnboundedSender<Outbound>,
    closing: CancellationToken,
    next_seq: u64,
    torn_down: bool,
}

impl Outlet for TcpOutlet {
    fn link_id(&self) -> LinkId {
        self.link
    }

    fn mdu(&self) -> usize {
        self.mdu
    }

    fn rtt(&self) -> Duration {
        Duration::from_micros(self.shared.rtt_micros.load(Ordering::Relaxed))
    }

    fn send(&mut self, raw: Bytes) -> Result<Receipt, OutletError> {
        if !self.is_usable() {
            return Err(OutletError::Closed);
        }
        if raw.len() > self.mdu {
            return Err(OutletError::TooLarge {
                size: raw.len(),
                mdu: self.mdu,
            });
        }

        self.next_seq += 1;
        let seq = self.next_seq;
        self.tx
            .send(Outbound::Packet { seq, raw })
            .map_err(|_| OutletError::Closed)?;
        Ok(Receipt(seq))
    }

    fn receipt_state(&self, receipt: Receipt) -> ReceiptState {
        if self.shared.flushed.load(Ordering::Acquire) >= receipt.0 {
            ReceiptState::Delivered
        } else if self.shared.closed.load(Ordering::Acquire) {
            ReceiptState::Failed
        } else {
            ReceiptState::Sent
        }
    }

    fn enable_packets(&mut self) {
        self.shared.packets_enabled.store(true, Ordering::Release);
        self.shared.packets_ready.notify_one();
    }

    fn disable_link_closed(&mut self) {
        self.shared.link_closed_enabled.store(false, Ordering::Release);
    }

    fn is_usable(&self) -> bool {
        !self.torn_down && !self.shared.closed.load(Ordering::Acquire)
    }

    fn teardown(&mut self) -> Result<(), OutletError> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        tracing::debug!("Tearing down {}", self.link);
        // The writer may already be gone if the peer closed first
        let _ = self.tx.send(Outbound::Close);
        self.closing.cancel();
        Ok(())
    }
}

fn micros_since(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_micros()).unwrap_or(u64::MAX)
}

fn forward_packets(events: &EventSender, link: LinkId, packets: impl Iterator<Item = Bytes>) -> bool {
    for raw in packets {
        if events.send(LinkEvent::PacketReceived { link, raw }.into()).is_err() {
            return false;
        }
    }
    true
}

/// Drive one accepted connection until either side closes it
///
/// Packets are forwarded only once the initiator has identified itself
/// and the session has enabled delivery; packets arriving in between are
/// held in order.
pub async fn serve_link(stream: TcpStream, link: LinkId, config: LinkConfig, events: EventSender) {
    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let shared = Arc::new(LinkShared::new());
    let closing = CancellationToken::new();
    let epoch = Instant::now();

    let writer_shared = Arc::clone(&shared);
    tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let result = match outbound {
                Outbound::Packet { seq, raw } => {
                    let result = sink.send(LinkFrame::Packet(raw)).await;
                    if result.is_ok() {
                        writer_shared.flushed.store(seq, Ordering::Release);
                    }
                    result
                }
                Outbound::Control(frame) => sink.send(frame).await,
                Outbound::Close => {
                    let _ = sink.send(LinkFrame::Close).await;
                    break;
                }
            };
            if let Err(e) = result {
                tracing::debug!("Write on {} failed: {}", link, e);
                break;
            }
        }
        writer_shared.closed.store(true, Ordering::Release);
        let _ = sink.close().await;
    });

    let outlet = TcpOutlet {
        link,
        mdu: config.mdu,
        shared: Arc::clone(&shared),
        tx: tx.clone(),
        closing: closing.clone(),
        next_seq: 0,
        torn_down: false,
    };
    if events
        .send(LoopEvent::Link(LinkEvent::Established {
            outlet: Box::new(outlet),
        }))
        .is_err()
    {
        tracing::debug!("Listener loop gone, dropping {}", link);
        return;
    }

    let mut keepalive = tokio::time::interval(config.keepalive_interval.max(MIN_KEEPALIVE));
    let mut identified = false;
    let mut held: VecDeque<Bytes> = VecDeque::new();

    loop {
        tokio::select! {
            _ = closing.cancelled() => break,

            _ = shared.packets_ready.notified(), if !held.is_empty() => {
                if !forward_packets(&events, link, held.drain(..)) {
                    break;
                }
            }

            _ = keepalive.tick() => {
                if tx.send(Outbound::Control(LinkFrame::Ping(micros_since(epoch)))).is_err() {
                    break;
                }
            }

            frame = frames.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::warn!("Bad frame on {}: {}", link, e);
                        break;
                    }
                    None => {
                        tracing::debug!("{} closed by peer", link);
                        break;
                    }
                };

                match frame {
                    LinkFrame::Identify(raw) => {
                        if identified {
                            tracing::debug!("Repeated identify on {} ignored", link);
                            continue;
                        }
                        let Some(identity) = IdentityHash::from_slice(&raw) else {
                            tracing::warn!("Malformed identity ({} bytes) on {}", raw.len(), link);
                            break;
                        };
                        identified = true;
                        if events.send(LinkEvent::IdentityConfirmed { link, identity }.into()).is_err() {
                            break;
                        }
                    }
                    LinkFrame::Packet(raw) => {
                        if !identified {
                            tracing::debug!("Packet on unidentified {} dropped", link);
                            continue;
                        }
                        if !shared.packets_enabled.load(Ordering::Acquire) {
                            if held.len() < MAX_HELD_PACKETS {
                                held.push_back(raw);
                            } else {
                                tracing::warn!("Too many held packets on {}, dropping", link);
                            }
                            continue;
                        }
                        let pending = held.drain(..).chain(std::iter::once(raw));
                        if !forward_packets(&events, link, pending) {
                            break;
                        }
                    }
                    LinkFrame::Ping(ts) => {
                        if tx.send(Outbound::Control(LinkFrame::Pong(ts))).is_err() {
                            break;
                        }
                    }
                    LinkFrame::Pong(ts) => {
                        let sample = micros_since(epoch).saturating_sub(ts);
                        shared.record_rtt(sample);
                        tracing::trace!("RTT sample on {}: {}us", link, sample);
                    }
                    LinkFrame::Close => {
                        tracing::debug!("{} closed by peer", link);
                        break;
                    }
                }
            }
        }
    }

    shared.closed.store(true, Ordering::Release);
    let _ = tx.send(Outbound::Close);

    if shared.link_closed_enabled.load(Ordering::Acquire) {
        let _ = events.send(LinkEvent::LinkClosed { link }.into());
    }
}
