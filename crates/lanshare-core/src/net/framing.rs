//! Length-prefixed frames over a plain or encrypted stream
//!
//! Structured messages are postcard-encoded and written as
//! `[len: u32 BE][payload]`. File contents are written as raw bytes
//! between frames. Both go through the same [`FramedStream`] so the
//! encrypted channel is a transparent wrapper.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::ChannelCipher;
use crate::error::{ShareError, ShareResult};
use crate::net::channel::EncryptedChannel;

/// Largest frame accepted before allocation
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

enum Link<S> {
    Plain(S),
    Encrypted(EncryptedChannel<S>),
}

/// A stream that speaks frames and raw byte runs
pub struct FramedStream<S> {
    link: Link<S>,
    bytes_written: u64,
    bytes_read: u64,
}

impl<S> std::fmt::Debug for FramedStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedStream")
            .field("encrypted", &matches!(self.link, Link::Encrypted(_)))
            .field("bytes_written", &self.bytes_written)
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> FramedStream<S> {
    /// Unencrypted framing
    pub fn plain(stream: S) -> Self {
        Self {
            link: Link::Plain(stream),
            bytes_written: 0,
            bytes_read: 0,
        }
    }

    /// Framing over an encrypted channel
    pub fn encrypted(stream: S, cipher: ChannelCipher) -> Self {
        Self {
            link: Link::Encrypted(EncryptedChannel::new(stream, cipher)),
            bytes_written: 0,
            bytes_read: 0,
        }
    }

    /// Plain or encrypted depending on whether a cipher is given
    pub fn new(stream: S, cipher: Option<ChannelCipher>) -> Self {
        match cipher {
            Some(cipher) => Self::encrypted(stream, cipher),
            None => Self::plain(stream),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.link, Link::Encrypted(_))
    }

    /// Application bytes written so far (before encryption overhead)
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Application bytes read so far
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Write raw bytes
    pub async fn write_bytes(&mut self, data: &[u8]) -> ShareResult<()> {
        match &mut self.link {
            Link::Plain(s) => s.write_all(data).await?,
            Link::Encrypted(c) => c.write_all(data).await?,
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Read exactly `buf.len()` raw bytes
    pub async fn read_bytes_exact(&mut self, buf: &mut [u8]) -> ShareResult<()> {
        match &mut self.link {
            Link::Plain(s) => {
                s.read_exact(buf).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        ShareError::Transport("connection closed mid-stream".into())
                    } else {
                        ShareError::Io(e)
                    }
                })?;
            }
            Link::Encrypted(c) => c.read_exact(buf).await?,
        }
        self.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Write one length-prefixed frame
    pub async fn write_frame(&mut self, payload: &[u8]) -> ShareResult<()> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ShareError::Protocol(format!(
                "frame of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_FRAME_SIZE
            )));
        }
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);
        self.write_bytes(&buf).await
    }

    /// Read one length-prefixed frame, rejecting declared lengths above `max`
    pub async fn read_frame(&mut self, max: usize) -> ShareResult<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.read_bytes_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > max.min(MAX_FRAME_SIZE) {
            return Err(ShareError::Protocol(format!(
                "declared frame length {} exceeds limit of {}",
                len,
                max.min(MAX_FRAME_SIZE)
            )));
        }
        let mut payload = vec![0u8; len];
        self.read_bytes_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Encode and send a message
    pub async fn send<T: Serialize>(&mut self, message: &T) -> ShareResult<()> {
        let bytes = postcard::to_allocvec(message)?;
        self.write_frame(&bytes).await
    }

    /// Receive and decode a message
    pub async fn recv<T: DeserializeOwned>(&mut self) -> ShareResult<T> {
        let bytes = self.read_frame(MAX_FRAME_SIZE).await?;
        postcard::from_bytes(&bytes)
            .map_err(|e| ShareError::Protocol(format!("malformed frame: {}", e)))
    }

    pub async fn flush(&mut self) -> ShareResult<()> {
        match &mut self.link {
            Link::Plain(s) => s.flush().await?,
            Link::Encrypted(c) => c.flush().await?,
        }
        Ok(())
    }

    /// Flush and close the write half
    pub async fn shutdown(&mut self) -> ShareResult<()> {
        match &mut self.link {
            Link::Plain(s) => s.shutdown().await?,
            Link::Encrypted(c) => c.shutdown().await?,
        }
        Ok(())
    }

    pub fn into_inner(self) -> S {
        match self.link {
            Link::Plain(s) => s,
            Link::Encrypted(c) => c.into_inner(),
        }
    }
}
