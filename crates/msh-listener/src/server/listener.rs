//! TCP accept loop
//!
//! Accepts incoming connections and spawns a link task for each one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use msh_protocol::LinkId;

use super::link::{serve_link, LinkConfig};
use crate::event::EventSender;

/// Server that turns TCP connections into links
pub struct LinkServer {
    /// Transport settings applied to every link
    config: LinkConfig,
    /// Queue of the listener loop
    events: EventSender,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
    next_link: AtomicU32,
}

impl LinkServer {
    pub fn new(config: LinkConfig, events: EventSender, cancel: CancellationToken) -> Self {
        Self {
            config,
            events,
            cancel,
            next_link: AtomicU32::new(1),
        }
    }

    /// Bind `bind_addr` and accept links until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Accept links on an already bound listener until cancelled
    ///
    /// Established links outlive the accept loop; the sessions tear them
    /// down during shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Listening for links on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Link server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let link = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        tracing::info!("New connection from {} as {}", peer_addr, link);

        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY on {}: {}", link, e);
        }

        let config = self.config.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            serve_link(socket, link, config, events).await;
            tracing::info!("Connection from {} ({}) closed", peer_addr, link);
        });
    }
}
