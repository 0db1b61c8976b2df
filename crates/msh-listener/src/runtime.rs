//! Listener event loop and wiring
//!
//! One task owns the [`SessionRegistry`] and consumes the event queue,
//! the scheduler tick and the timer deadlines one at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use msh_core::config::ListenerConfig;

use crate::context::{ListenerContext, ListenerPolicy};
use crate::event::{self, EventReceiver};
use crate::messenger::RetryingMessenger;
use crate::process::NativeSpawner;
use crate::server::{LinkConfig, LinkServer};
use crate::session::SessionRegistry;

/// Reason sent to every peer when the listener stops
pub const SHUTDOWN_REASON: &str = "Listener shutting down";

/// Time given to the links to flush the shutdown errors
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(250);

const MIN_TICK: Duration = Duration::from_millis(1);

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Run the listener loop until `cancel` fires, then shut every session down
///
/// Returns the registry, which is empty once shutdown completes.
pub async fn run_event_loop(
    mut registry: SessionRegistry,
    mut events: EventReceiver,
    tick: Duration,
    cancel: CancellationToken,
) -> SessionRegistry {
    let mut ticker = tokio::time::interval(tick.max(MIN_TICK));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let timer = sleep_until(registry.next_deadline());

        tokio::select! {
            _ = cancel.cancelled() => break,

            event = events.recv() => match event {
                Some(event) => registry.dispatch(event, Instant::now()),
                None => {
                    tracing::debug!("Event queue closed");
                    break;
                }
            },

            _ = ticker.tick() => {
                let now = Instant::now();
                registry.service(now);
                if registry.pump_all(now).await {
                    // More output may be waiting; pump again without a full tick
                    ticker.reset_immediately();
                }
            }

            _ = timer => registry.fire_due(Instant::now()),
        }
    }

    tracing::info!("Shutting down {} sessions", registry.len());
    registry.terminate_all(SHUTDOWN_REASON, Instant::now()).await;
    tokio::time::sleep(SHUTDOWN_FLUSH).await;
    registry.prune_all(Instant::now());

    registry
}

/// Serve links accepted on `listener` until `cancel` fires
pub async fn serve(
    config: ListenerConfig,
    listener: TcpListener,
    cancel: CancellationToken,
) -> Result<()> {
    let policy = ListenerPolicy::from_config(&config).context("Invalid listener configuration")?;
    let (events_tx, events_rx) = event::channel();

    let ctx = ListenerContext::new(
        policy,
        Box::new(RetryingMessenger::new(config.messenger.clone())),
        Arc::new(NativeSpawner::new()),
        events_tx.clone(),
    );
    let registry = SessionRegistry::new(ctx);

    let event_loop = tokio::spawn(run_event_loop(
        registry,
        events_rx,
        config.tick_interval,
        cancel.clone(),
    ));

    let server = LinkServer::new(LinkConfig::from_config(&config), events_tx, cancel.clone());
    let result = server.serve(listener).await;

    // Stop the loop too if the accept loop failed on its own
    cancel.cancel();
    event_loop.await.context("Listener loop failed")?;

    result
}
