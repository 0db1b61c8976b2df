//! Session registry and scheduler tick
//!
//! The registry is the only process-wide collection of sessions. Sessions
//! are added when a link is established and removed when they are pruned.
//! It is owned by the listener loop, so no locking is involved.

use std::time::Instant;

use msh_core::traits::ProcessOutput;
use msh_protocol::LinkId;

use super::listener::SessionEnv;
use super::{ListenerSession, SessionState, TimerKind, TimerQueue};
use crate::context::ListenerContext;
use crate::event::{LinkEvent, LoopEvent};

/// All live sessions plus the timers supervising them
pub struct SessionRegistry {
    ctx: ListenerContext,
    sessions: Vec<ListenerSession>,
    timers: TimerQueue,
}

impl SessionRegistry {
    pub fn new(ctx: ListenerContext) -> Self {
        Self {
            ctx,
            sessions: Vec::new(),
            timers: TimerQueue::new(),
        }
    }

    pub fn context(&self) -> &ListenerContext {
        &self.ctx
    }

    /// Number of registered sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Session bound to `link`
    pub fn get(&self, link: LinkId) -> Option<&ListenerSession> {
        self.sessions.iter().find(|s| s.link() == link)
    }

    /// Links of all registered sessions, in arrival order
    pub fn links(&self) -> Vec<LinkId> {
        self.sessions.iter().map(ListenerSession::link).collect()
    }

    /// Earliest pending timer deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    fn with_session<R>(
        &mut self,
        link: LinkId,
        now: Instant,
        f: impl FnOnce(&mut ListenerSession, &mut SessionEnv<'_>) -> R,
    ) -> Option<R> {
        let index = self.sessions.iter().position(|s| s.link() == link)?;
        let mut env = SessionEnv {
            ctx: &mut self.ctx,
            timers: &mut self.timers,
            now,
        };
        Some(f(&mut self.sessions[index], &mut env))
    }

    /// Apply one loop event
    pub fn dispatch(&mut self, event: LoopEvent, now: Instant) {
        match event {
            LoopEvent::Link(event) => self.handle_link_event(event, now),
            LoopEvent::Process { link, output } => self.handle_process_output(link, output, now),
        }
    }

    fn handle_link_event(&mut self, event: LinkEvent, now: Instant) {
        let link = event.link();
        let handled = match event {
            LinkEvent::Established { mut outlet } => {
                if self.get(link).is_some() {
                    tracing::warn!("Duplicate link {}, dropping new outlet", link);
                    if let Err(e) = outlet.teardown() {
                        tracing::debug!("Teardown of duplicate {} failed: {}", link, e);
                    }
                    return;
                }
                tracing::info!("Link {} established", link);
                let mut env = SessionEnv {
                    ctx: &mut self.ctx,
                    timers: &mut self.timers,
                    now,
                };
                let session = ListenerSession::new(outlet, &mut env);
                self.sessions.push(session);
                Some(())
            }
            LinkEvent::IdentityConfirmed { identity, .. } => {
                self.with_session(link, now, |s, env| s.on_identity(identity, env))
            }
            LinkEvent::PacketReceived { raw, .. } => {
                self.with_session(link, now, |s, env| s.on_packet(&raw, env))
            }
            LinkEvent::LinkClosed { .. } => {
                tracing::info!("Link {} closed", link);
                self.with_session(link, now, |s, env| s.on_link_closed(env))
            }
        };

        if handled.is_none() {
            tracing::debug!("Event for unknown {} dropped", link);
        }
    }

    fn handle_process_output(&mut self, link: LinkId, output: ProcessOutput, now: Instant) {
        if self
            .with_session(link, now, |s, _| s.on_process_output(output))
            .is_none()
        {
            tracing::debug!("Process output for unknown {} dropped", link);
        }
    }

    /// Fire every timer due at `now`
    pub fn fire_due(&mut self, now: Instant) {
        for (link, kind) in self.timers.pop_due(now) {
            let fired = self.with_session(link, now, |s, env| {
                s.on_timer(kind, env);
                s.state()
            });

            match fired {
                Some(SessionState::Teardown) => self.remove(link),
                Some(_) => {}
                None => tracing::trace!("Timer {:?} for removed {} ignored", kind, link),
            }
        }
    }

    fn remove(&mut self, link: LinkId) {
        if let Some(index) = self.sessions.iter().position(|s| s.link() == link) {
            self.sessions.remove(index);
            tracing::info!("Session on {} removed", link);
        }
    }

    /// Drive message retries on every link
    pub fn service(&mut self, now: Instant) {
        for index in 0..self.sessions.len() {
            let mut env = SessionEnv {
                ctx: &mut self.ctx,
                timers: &mut self.timers,
                now,
            };
            self.sessions[index].service(&mut env);
        }
    }

    /// Give every session one chance to send, yielding between sessions.
    /// Returns whether any session sent something.
    pub async fn pump_all(&mut self, now: Instant) -> bool {
        let mut processed_any = false;
        for index in 0..self.sessions.len() {
            let mut env = SessionEnv {
                ctx: &mut self.ctx,
                timers: &mut self.timers,
                now,
            };
            processed_any |= self.sessions[index].pump(&mut env);
            tokio::task::yield_now().await;
        }
        processed_any
    }

    /// Terminate every session with `reason`, yielding between sessions
    pub async fn terminate_all(&mut self, reason: &str, now: Instant) {
        for index in 0..self.sessions.len() {
            let mut env = SessionEnv {
                ctx: &mut self.ctx,
                timers: &mut self.timers,
                now,
            };
            self.sessions[index].terminate(Some(reason), &mut env);
            tokio::task::yield_now().await;
        }
    }

    /// Tear every session down immediately, skipping the prune delay
    pub fn prune_all(&mut self, now: Instant) {
        for mut session in std::mem::take(&mut self.sessions) {
            let mut env = SessionEnv {
                ctx: &mut self.ctx,
                timers: &mut self.timers,
                now,
            };
            session.terminate(None, &mut env);
            session.on_timer(TimerKind::Prune, &mut env);
            tracing::debug!("Session on {} pruned", session.link());
        }
    }
}
