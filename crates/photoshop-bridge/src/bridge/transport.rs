//! Outbound connections to the host.
//!
//! Every outbound message gets a fresh loopback connection: the payload has no
//! length prefix, so the host only knows a message is complete when the
//! connection closes. Nothing is pooled or shared between callers.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::codec::{Message, write_message};
use crate::error::BridgeError;

/// Target for frame-level network tracing.
pub const NETWORK_TARGET: &str = "photoshop_bridge::network";

/// Log a frame when network tracing is on.
pub fn trace_frame(enabled: bool, direction: &'static str, message: &Message) {
    if !enabled {
        return;
    }
    match message {
        Message::Request(xml) | Message::Response(xml) => tracing::debug!(
            target: NETWORK_TARGET,
            direction,
            kind = ?message.message_type(),
            payload_bytes = xml.len(),
            payload = %xml,
            "Frame"
        ),
        _ => tracing::debug!(
            target: NETWORK_TARGET,
            direction,
            kind = ?message.message_type(),
            payload_bytes = message.payload_len(),
            "Frame"
        ),
    }
}

/// Delivery of outbound messages to the host.
///
/// Abstracted so the correlator can be tested without a real host process.
#[async_trait]
pub trait HostLink: Send + Sync {
    async fn send(&self, message: Message) -> Result<(), BridgeError>;
}

/// Loopback address of the host extension's server socket.
#[derive(Debug, Clone)]
pub struct HostEndpoint {
    addr: SocketAddr,
    network_debug: bool,
}

impl HostEndpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            network_debug: false,
        }
    }

    /// The host only ever listens on 127.0.0.1.
    pub fn localhost(port: u16) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    pub fn with_network_debug(mut self, enabled: bool) -> Self {
        self.network_debug = enabled;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn network_debug(&self) -> bool {
        self.network_debug
    }

    /// Open a new connection with Nagle disabled so the tag goes out on its own.
    pub async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Send one message on its own connection and close it.
    pub async fn send_message(&self, message: &Message) -> io::Result<()> {
        let mut stream = self.connect().await?;
        trace_frame(self.network_debug, "out", message);
        write_message(&mut stream, message).await?;
        stream.shutdown().await
    }
}

#[async_trait]
impl HostLink for HostEndpoint {
    async fn send(&self, message: Message) -> Result<(), BridgeError> {
        self.send_message(&message).await.map_err(|e| {
            tracing::warn!(addr = %self.addr, error = %e, "Failed to send to host");
            BridgeError::Connection(e)
        })
    }
}
