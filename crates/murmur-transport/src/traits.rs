//! Transport abstraction traits for Murmur.
//!
//! These traits define the interface that all transport implementations must
//! provide, allowing the connection handler to be transport-agnostic. A
//! connection is split into a reading half and a writing half so that reads
//! and writes can proceed on different tasks.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error. The connection is still usable afterwards.
    #[error("Protocol error: {0}")]
    Protocol(#[from] murmur_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method waits until a new connection is available or an error
    /// occurs.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "tcp", "websocket").
    fn name(&self) -> &'static str;
}

/// An accepted connection, not yet split.
pub trait Connection: Send {
    /// Name of the transport that produced this connection.
    fn transport(&self) -> &'static str;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Split into independently owned reading and writing halves.
    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>);
}

/// Reading half of a connection.
#[async_trait]
pub trait FrameReader: Send {
    /// Receive the next frame, without its delimiter.
    ///
    /// Returns `Ok(None)` if the peer closed the connection cleanly. A
    /// [`TransportError::Protocol`] error means one frame was rejected and
    /// reading may continue.
    async fn read_frame(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Writing half of a connection.
#[async_trait]
pub trait FrameWriter: Send {
    /// Send one encoded envelope. The transport adds any framing it needs.
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}
