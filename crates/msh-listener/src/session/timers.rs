//! Single-shot session timers
//!
//! Timers carry their own guard. When one fires the registry re-checks the
//! guard against the session's current state; a stale timer is a no-op, so
//! nothing is ever cancelled.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use msh_protocol::LinkId;

use super::SessionState;

/// What a timer does when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Time out unless the session left `armed`
    Watchdog { armed: SessionState },
    /// Time out unless the peer closed the link after the exit code
    ExitWatchdog,
    /// Remove the session and tear its link down
    Prune,
}

#[derive(Debug)]
struct Timer {
    deadline: Instant,
    seq: u64,
    link: LinkId,
    kind: TimerKind,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    // Reversed so the max-heap yields the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Deadline-ordered queue of pending session timers
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Timer>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer for `link` firing at `deadline`
    pub fn schedule(&mut self, link: LinkId, kind: TimerKind, deadline: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Timer {
            deadline,
            seq,
            link,
            kind,
        });
    }

    /// Arm a timer for `link` firing `delay` after `now`
    ///
    /// A delay too large to represent never fires.
    pub fn schedule_after(
        &mut self,
        link: LinkId,
        kind: TimerKind,
        now: Instant,
        delay: Duration,
    ) {
        match now.checked_add(delay) {
            Some(deadline) => self.schedule(link, kind, deadline),
            None => {
                tracing::debug!("{}: {:?} delay {:?} out of range, not armed", link, kind, delay)
            }
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|t| t.deadline)
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<(LinkId, TimerKind)> {
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|t| t.deadline <= now) {
            if let Some(timer) = self.heap.pop() {
                due.push((timer.link, timer.kind));
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
