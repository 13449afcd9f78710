//! Inbound listener with typestate for the startup sequence.
//!
//! `BoundListener` (ephemeral loopback port) -> `register()` reports the port
//! to the host with a SetPort message -> `RegisteredListener::listen()` accepts
//! connections until shutdown. Every accepted connection gets its own task
//! that reads exactly one message, dispatches it and ends.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{Message, read_message, write_message};
use crate::bridge::transport::{HostEndpoint, trace_frame};
use crate::dispatch::InboundRouter;
use crate::error::BridgeError;

/// Listener bound to an OS-assigned port; the host does not know it yet.
pub struct BoundListener {
    listener: TcpListener,
    port: u16,
}

impl BoundListener {
    pub async fn bind() -> io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).await?;
        let port = listener.local_addr()?.port();
        tracing::info!(port, "Listening for host connections");
        Ok(Self { listener, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Report our port to the host. Without this the host cannot answer
    /// anything, so callers treat failure as fatal.
    pub async fn register(self, host: &HostEndpoint) -> Result<RegisteredListener, BridgeError> {
        host.send_message(&Message::SetPort(self.port))
            .await
            .map_err(|e| {
                tracing::error!(port = self.port, host = %host.addr(), error = %e, "Failed to report port to host");
                BridgeError::Connection(e)
            })?;
        tracing::debug!(port = self.port, host = %host.addr(), "Registered port with host");
        Ok(RegisteredListener {
            listener: self.listener,
            port: self.port,
        })
    }
}

/// Listener whose port the host knows.
pub struct RegisteredListener {
    listener: TcpListener,
    port: u16,
}

impl RegisteredListener {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept connections until `shutdown` fires.
    pub fn listen(self, router: Arc<InboundRouter>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(accept_loop(self.listener, router, shutdown))
    }
}

async fn accept_loop(listener: TcpListener, router: Arc<InboundRouter>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%peer, "Accepted host connection");
                    let router = Arc::clone(&router);
                    tokio::spawn(handle_connection(stream, router));
                }
                Err(e) => {
                    // Typically fd exhaustion; back off instead of spinning.
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
}

/// Read the connection's single message and dispatch it.
pub async fn handle_connection(mut stream: TcpStream, router: Arc<InboundRouter>) {
    // Documents end at EOF, so a peer that never closes would hold the task
    // forever. The codec caps the size; this caps the time.
    let message = match tokio::time::timeout(router.read_timeout(), read_message(&mut stream)).await {
        Ok(Ok(message)) => message,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "Failed to read inbound message");
            return;
        }
        Err(_) => {
            tracing::warn!(
                timeout_ms = router.read_timeout().as_millis() as u64,
                "Inbound connection did not finish its message in time"
            );
            return;
        }
    };
    trace_frame(router.network_debug(), "in", &message);

    if message == Message::Ping {
        if let Err(e) = write_message(&mut stream, &Message::Pong).await {
            tracing::debug!(error = %e, "Failed to answer host ping");
        }
        return;
    }

    if let Err(e) = router.route(message) {
        tracing::error!(error = %e, "Failed to handle inbound message");
    }
}
