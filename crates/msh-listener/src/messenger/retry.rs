//! Retrying messenger
//!
//! Every message is sent as one packet and tracked by its receipt until the
//! outlet reports it delivered. Packets still unconfirmed when their backoff
//! delay expires are sent again; after `max_attempts` the outlet is timed
//! out, which tears the link down.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use msh_core::config::MessengerConfig;
use msh_core::error::OutletError;
use msh_core::traits::{Outlet, Receipt, ReceiptState};
use msh_core::MshError;
use msh_protocol::{packet, LinkId, Message, ProtocolError};

use super::backoff::ExponentialBackoff;
use super::Messenger;

struct InFlight {
    receipt: Receipt,
    raw: Bytes,
    attempts: u32,
    next_attempt: Instant,
    backoff: ExponentialBackoff,
}

/// Messenger that resends unconfirmed packets with exponential backoff
pub struct RetryingMessenger {
    config: MessengerConfig,
    in_flight: HashMap<LinkId, VecDeque<InFlight>>,
}

impl RetryingMessenger {
    pub fn new(config: MessengerConfig) -> Self {
        Self {
            config,
            in_flight: HashMap::new(),
        }
    }

    /// Unconfirmed packets tracked for `link`
    pub fn in_flight(&self, link: LinkId) -> usize {
        self.in_flight.get(&link).map_or(0, VecDeque::len)
    }
}

impl Default for RetryingMessenger {
    fn default() -> Self {
        Self::new(MessengerConfig::default())
    }
}

impl Messenger for RetryingMessenger {
    fn send(&mut self, outlet: &mut dyn Outlet, message: &Message) -> Result<(), MshError> {
        let raw = packet::encode(message)?;
        let mdu = outlet.mdu();
        if raw.len() > mdu {
            return Err(OutletError::TooLarge {
                size: raw.len(),
                mdu,
            }
            .into());
        }

        let receipt = outlet.send(raw.clone())?;
        tracing::trace!(
            "Sent {} ({} bytes) on {}",
            message.name(),
            raw.len(),
            outlet.link_id()
        );

        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let next_attempt = Instant::now() + backoff.next_delay();
        self.in_flight
            .entry(outlet.link_id())
            .or_default()
            .push_back(InFlight {
                receipt,
                raw,
                attempts: 1,
                next_attempt,
                backoff,
            });

        Ok(())
    }

    fn receive(&self, raw: &[u8]) -> Result<Message, ProtocolError> {
        packet::decode(raw)
    }

    fn is_outlet_ready(&self, outlet: &dyn Outlet) -> bool {
        if !outlet.is_usable() {
            return false;
        }
        let pending = self.in_flight.get(&outlet.link_id()).map_or(0, |queue| {
            queue
                .iter()
                .filter(|p| outlet.receipt_state(p.receipt) != ReceiptState::Delivered)
                .count()
        });
        pending < self.config.max_in_flight
    }

    fn clear_retries(&mut self, outlet: &dyn Outlet) {
        if let Some(queue) = self.in_flight.remove(&outlet.link_id()) {
            if !queue.is_empty() {
                tracing::debug!(
                    "Dropped {} unconfirmed packets on {}",
                    queue.len(),
                    outlet.link_id()
                );
            }
        }
    }

    fn service(&mut self, outlet: &mut dyn Outlet, now: Instant) {
        let link = outlet.link_id();
        let Some(queue) = self.in_flight.get_mut(&link) else {
            return;
        };

        queue.retain(|p| outlet.receipt_state(p.receipt) != ReceiptState::Delivered);

        let mut gave_up = false;
        for pending in queue.iter_mut() {
            let failed = outlet.receipt_state(pending.receipt) == ReceiptState::Failed;
            if !failed && now < pending.next_attempt {
                continue;
            }

            if pending.attempts >= self.config.max_attempts {
                tracing::warn!(
                    "Packet on {} unconfirmed after {} attempts, timing out link",
                    link,
                    pending.attempts
                );
                gave_up = true;
                break;
            }

            match outlet.send(pending.raw.clone()) {
                Ok(receipt) => {
                    pending.receipt = receipt;
                    pending.attempts += 1;
                    pending.next_attempt = now + pending.backoff.next_delay();
                    tracing::debug!("Resent packet on {} (attempt {})", link, pending.attempts);
                }
                Err(e) => {
                    tracing::debug!("Resend on {} failed: {}", link, e);
                    pending.attempts += 1;
                    pending.next_attempt = now + pending.backoff.next_delay();
                }
            }
        }

        if gave_up {
            self.in_flight.remove(&link);
            outlet.timed_out();
        } else if queue.is_empty() {
            self.in_flight.remove(&link);
        }
    }
}
