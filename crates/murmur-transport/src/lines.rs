//! Newline-delimited framing over any byte stream.
//!
//! Shared by the TCP and in-memory transports.

use crate::traits::{FrameReader, FrameWriter, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use murmur_protocol::codec::{LineFramer, DELIMITER};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 4096;

/// Reads line frames from an [`AsyncRead`].
pub struct LineReader<R> {
    inner: R,
    buffer: BytesMut,
    framer: LineFramer,
    eof: bool,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Wrap a reader with the given frame size limit.
    #[must_use]
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            framer: LineFramer::new(max_frame_size),
            eof: false,
        }
    }
}

#[async_trait]
impl<R> FrameReader for LineReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_frame(&mut self) -> Result<Option<Bytes>, TransportError> {
        loop {
            if let Some(frame) = self.framer.next_frame(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if self.eof {
                return Ok(self.framer.finish(&mut self.buffer));
            }

            self.buffer.reserve(READ_CHUNK);
            if self.inner.read_buf(&mut self.buffer).await? == 0 {
                self.eof = true;
            }
        }
    }
}

/// Writes line frames to an [`AsyncWrite`].
pub struct LineWriter<W> {
    inner: W,
}

impl<W> LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a writer.
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> FrameWriter for LineWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
        self.inner.write_all(&frame).await?;
        if frame.last() != Some(&DELIMITER) {
            self.inner.write_all(&[DELIMITER]).await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
