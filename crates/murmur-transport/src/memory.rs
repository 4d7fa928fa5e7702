//! In-memory transport.
//!
//! Connections are pairs of in-process pipes framed exactly like TCP, which
//! makes this transport suitable for driving the full connection handler
//! from tests without opening sockets.

use crate::lines::{LineReader, LineWriter};
use crate::traits::{Connection, FrameReader, FrameWriter, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use murmur_protocol::{codec, Event, MAX_FRAME_SIZE};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

/// Default bytes buffered in each direction of a connection.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// In-memory transport.
pub struct MemoryTransport {
    incoming: Mutex<mpsc::Receiver<MemoryConnection>>,
    connector: MemoryConnector,
}

impl MemoryTransport {
    /// Create a transport with the default frame size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a transport with the given frame size limit.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            incoming: Mutex::new(rx),
            connector: MemoryConnector {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
                max_frame_size,
                pipe_capacity: PIPE_CAPACITY,
            },
        }
    }

    /// Buffer at most `capacity` bytes per direction. Writes beyond that wait
    /// until the other end reads.
    #[must_use]
    pub fn with_pipe_capacity(mut self, capacity: usize) -> Self {
        self.connector.pipe_capacity = capacity.max(1);
        self
    }

    /// A handle clients use to open connections.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        self.connector.clone()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        match self.incoming.lock().await.recv().await {
            Some(connection) => Ok(Box::new(connection)),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Opens connections to a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryConnector {
    tx: mpsc::Sender<MemoryConnection>,
    next_id: Arc<AtomicU64>,
    max_frame_size: usize,
    pipe_capacity: usize,
}

impl MemoryConnector {
    /// Open a connection and return the client end.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport has been dropped.
    pub async fn connect(&self) -> Result<MemoryClient, TransportError> {
        let (client, server) = tokio::io::duplex(self.pipe_capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.tx
            .send(MemoryConnection {
                stream: server,
                name: format!("memory-{id}"),
                max_frame_size: self.max_frame_size,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        let (read_half, write_half) = tokio::io::split(client);
        Ok(MemoryClient {
            reader: LineReader::new(read_half, usize::MAX),
            writer: LineWriter::new(write_half),
        })
    }
}

/// The server end of an in-memory connection.
pub struct MemoryConnection {
    stream: DuplexStream,
    name: String,
    max_frame_size: usize,
}

impl Connection for MemoryConnection {
    fn transport(&self) -> &'static str {
        "memory"
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn split(self: Box<Self>) -> (Box<dyn FrameReader>, Box<dyn FrameWriter>) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            Box::new(LineReader::new(read_half, self.max_frame_size)),
            Box::new(LineWriter::new(write_half)),
        )
    }
}

/// The client end of an in-memory connection.
pub struct MemoryClient {
    reader: LineReader<ReadHalf<DuplexStream>>,
    writer: LineWriter<WriteHalf<DuplexStream>>,
}

impl MemoryClient {
    /// Send raw bytes as one line.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is gone.
    pub async fn send_raw(&mut self, line: impl Into<Bytes>) -> Result<(), TransportError> {
        self.writer.write_frame(line.into()).await
    }

    /// Encode and send an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails or the connection is gone.
    pub async fn send<T: Serialize>(&mut self, envelope: &T) -> Result<(), TransportError> {
        let data = codec::encode(envelope)?;
        self.writer.write_frame(data).await
    }

    /// Receive the next event, or `None` once the server has closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the server sent something that is not an event.
    pub async fn recv(&mut self) -> Result<Option<Event>, TransportError> {
        match self.reader.read_frame().await? {
            Some(frame) => Ok(Some(codec::decode_event(&frame)?)),
            None => Ok(None),
        }
    }

    /// Close the client's writing side.
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_protocol::Command;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let transport = MemoryTransport::new();
        let mut client = transport.connector().connect().await.unwrap();

        let connection = transport.accept().await.unwrap();
        assert_eq!(connection.transport(), "memory");
        assert_eq!(connection.remote_addr().as_deref(), Some("memory-1"));

        let (mut reader, mut writer) = connection.split();
        client.send(&Command::chat("hi")).await.unwrap();
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(codec::decode(&frame).unwrap(), Command::chat("hi"));

        let reply = codec::encode(&Event::system("hello")).unwrap();
        writer.write_frame(reply).await.unwrap();
        assert_eq!(client.recv().await.unwrap(), Some(Event::system("hello")));

        client.close().await.unwrap();
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_small_pipe_blocks_writer_until_read() {
        let transport = MemoryTransport::new().with_pipe_capacity(16);
        let mut client = transport.connector().connect().await.unwrap();
        let (_reader, mut writer) = transport.accept().await.unwrap().split();

        let frame = codec::encode(&Event::system("more than sixteen bytes")).unwrap();
        let mut write = writer.write_frame(frame);
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(50), &mut write).await;
        assert!(blocked.is_err());

        let (sent, received) = tokio::join!(write, client.recv());
        sent.unwrap();
        assert_eq!(
            received.unwrap(),
            Some(Event::system("more than sixteen bytes"))
        );
    }

    #[tokio::test]
    async fn test_connections_are_named_in_order() {
        let transport = MemoryTransport::new();
        let connector = transport.connector();
        let _a = connector.connect().await.unwrap();
        let _b = connector.connect().await.unwrap();

        let first = transport.accept().await.unwrap();
        let second = transport.accept().await.unwrap();
        assert_eq!(first.remote_addr().as_deref(), Some("memory-1"));
        assert_eq!(second.remote_addr().as_deref(), Some("memory-2"));
    }
}
