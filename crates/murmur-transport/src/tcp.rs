//! Raw TCP transport with newline-delimited JSON framing.

use crate::lines::{LineReader, LineWriter};
use crate::traits::{Connection, FrameReader, FrameWriter, Transport, TransportError};
use async_trait::async_trait;
use murmur_protocol::MAX_FRAME_SIZE;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!("TCP transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new TCP transport with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(TcpConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }
        debug!("Accepted TCP connection from {}", addr);

        Ok(Box::new(TcpConnection {
            stream,
            remote_addr: addr,
            max_frame_size: self.config.max_frame_size,
        }))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// A TCP connection.
pub struct TcpConnection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    max_frame_size: usize,
}

impl Connection for TcpConnection {
    fn transport(&self) -> &'static str {
        "tcp"
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (read_half, write_half) = self.stream.into_split();
        (
            Box::new(LineReader::new(read_half, self.max_frame_size)),
            Box::new(LineWriter::new(write_half)),
        )
    }
}
