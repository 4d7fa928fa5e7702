//! WebSocket transport adapter.
//!
//! Wraps an upgraded axum [`WebSocket`] as a [`Connection`]. Each text or
//! binary message carries one envelope; outbound envelopes are sent as text.

use crate::traits::{Connection, FrameReader, FrameWriter, TransportError};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use murmur_protocol::{ProtocolError, MAX_FRAME_SIZE};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Path the upgrade is served on.
    pub path: String,
    /// Maximum envelope size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/ws".to_string(),
            max_message_size: MAX_FRAME_SIZE,
        }
    }
}

/// An upgraded WebSocket connection.
pub struct WebSocketConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, remote_addr: Option<SocketAddr>, max_message_size: usize) -> Self {
        Self {
            socket,
            remote_addr,
            max_message_size,
        }
    }
}

impl Connection for WebSocketConnection {
    fn transport(&self) -> &'static str {
        "websocket"
    }

    fn remote_addr(&self) -> Option<String> {
        self.remote_addr.map(|addr| addr.to_string())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (sink, stream) = self.socket.split();
        (
            Box::new(WebSocketReader {
                stream,
                max_message_size: self.max_message_size,
            }),
            Box::new(WebSocketWriter { sink }),
        )
    }
}

/// Reading half of a WebSocket connection.
pub struct WebSocketReader {
    stream: SplitStream<WebSocket>,
    max_message_size: usize,
}

impl WebSocketReader {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                "Message too large: {} bytes (max: {})",
                len, self.max_message_size
            );
            return Err(ProtocolError::FrameTooLarge(len).into());
        }
        Ok(())
    }
}

#[async_trait]
impl FrameReader for WebSocketReader {
    async fn read_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    if text.trim().is_empty() {
                        continue;
                    }
                    return Ok(Some(Bytes::from(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    if data.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    return Ok(Some(Bytes::from(data)));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Pongs are queued by the socket itself.
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

/// Writing half of a WebSocket connection.
pub struct WebSocketWriter {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl FrameWriter for WebSocketWriter {
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }
}
