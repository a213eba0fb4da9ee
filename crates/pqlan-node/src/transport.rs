//! Message-preserving transport over byte streams.
//!
//! The protocol needs whole messages; TCP delivers bytes. [`FramedTransport`]
//! restores message boundaries with a 4-byte big-endian length prefix:
//!
//! ```text
//! ┌──────────────┬──────────────────────┐
//! │ len: u32 BE  │ message (len bytes)  │
//! └──────────────┴──────────────────────┘
//! ```
//!
//! Lengths above the configured maximum are rejected before any allocation.

use std::future::Future;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NodeError;

/// Default upper bound on a single frame (1 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 1 << 20;

const LENGTH_PREFIX: usize = 4;

/// Ordered, reliable, message-oriented connection to one peer.
///
/// The node drives one `Transport` per peer from a single task.
pub trait Transport: Send {
    /// Send one message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is too large or the stream failed.
    fn send(&mut self, message: &[u8]) -> impl Future<Output = Result<(), NodeError>> + Send;

    /// Receive the next message, or `None` once the peer closed cleanly.
    ///
    /// Must be cancel safe: the node polls it inside `tokio::select!`.
    ///
    /// # Errors
    ///
    /// Returns an error on stream failure, an oversized frame, or a stream
    /// that ends mid-frame.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Bytes>, NodeError>> + Send;
}

/// Length-prefixed framing over any tokio byte stream.
pub struct FramedTransport<S> {
    stream: S,
    read_buf: BytesMut,
    max_frame_len: usize,
}

impl<S> FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `stream` with the default frame limit.
    pub fn new(stream: S) -> Self {
        Self::with_max_frame_len(stream, DEFAULT_MAX_FRAME_LEN)
    }

    /// Wrap `stream` with a custom frame limit.
    pub fn with_max_frame_len(stream: S, max_frame_len: usize) -> Self {
        Self { stream, read_buf: BytesMut::with_capacity(8 * 1024), max_frame_len }
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Split a complete frame off the front of the read buffer.
    fn parse_frame(&mut self) -> Result<Option<Bytes>, NodeError> {
        if self.read_buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&self.read_buf[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(NodeError::FrameTooLarge { len, max: self.max_frame_len });
        }

        if self.read_buf.len() < LENGTH_PREFIX + len {
            self.read_buf.reserve(LENGTH_PREFIX + len - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX);
        Ok(Some(self.read_buf.split_to(len).freeze()))
    }
}

impl<S> Transport for FramedTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &[u8]) -> Result<(), NodeError> {
        if message.len() > self.max_frame_len {
            return Err(NodeError::FrameTooLarge { len: message.len(), max: self.max_frame_len });
        }

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + message.len());
        buf.put_u32(message.len() as u32);
        buf.put_slice(message);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Bytes>, NodeError> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(Some(frame));
            }

            // read_buf is cancel safe: partial data stays in self.read_buf
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(NodeError::TruncatedFrame);
            }
        }
    }
}
