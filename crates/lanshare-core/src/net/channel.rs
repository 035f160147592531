//! Authenticated-encryption framing over a raw byte stream
//!
//! Writes are split into chunks of at most [`MAX_PLAINTEXT_CHUNK`] bytes.
//! Each chunk is sealed with a fresh random nonce and written as:
//!
//! ```text
//! +-----------+------------+----------------------+
//! | len (u32) | nonce (12) | ciphertext + tag(16) |
//! +-----------+------------+----------------------+
//! ```
//!
//! Reads reverse this and fail closed: a bad tag, an impossible length or a
//! stream that ends inside a frame is an error, never partial plaintext.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{ChannelCipher, NONCE_SIZE, TAG_SIZE};
use crate::error::{ShareError, ShareResult};

/// Largest plaintext carried by one sealed frame
pub const MAX_PLAINTEXT_CHUNK: usize = 64 * 1024;

/// Largest sealed frame accepted from the wire
pub const MAX_SEALED_FRAME: usize = NONCE_SIZE + MAX_PLAINTEXT_CHUNK + TAG_SIZE;

/// Encrypted stream wrapper
pub struct EncryptedChannel<S> {
    stream: S,
    cipher: ChannelCipher,
    /// Decrypted bytes not yet handed to the reader
    read_buf: BytesMut,
}

impl<S> std::fmt::Debug for EncryptedChannel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedChannel")
            .field("buffered", &self.read_buf.len())
            .finish_non_exhaustive()
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> EncryptedChannel<S> {
    /// Wrap a stream. Both ends must use the same key.
    pub fn new(stream: S, cipher: ChannelCipher) -> Self {
        Self {
            stream,
            cipher,
            read_buf: BytesMut::new(),
        }
    }

    /// Seal and write all of `data`.
    pub async fn write_all(&mut self, data: &[u8]) -> ShareResult<()> {
        for chunk in data.chunks(MAX_PLAINTEXT_CHUNK) {
            let sealed = self.cipher.seal(chunk)?;
            // sealed.len() <= MAX_SEALED_FRAME, always fits in u32
            self.stream.write_u32(sealed.len() as u32).await?;
            self.stream.write_all(&sealed).await?;
        }
        Ok(())
    }

    /// Fill `out` completely with decrypted bytes.
    pub async fn read_exact(&mut self, out: &mut [u8]) -> ShareResult<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.read_buf.is_empty() {
                let plaintext = self.read_frame().await?;
                self.read_buf.extend_from_slice(&plaintext);
                continue;
            }
            let n = (out.len() - filled).min(self.read_buf.len());
            out[filled..filled + n].copy_from_slice(&self.read_buf[..n]);
            self.read_buf.advance(n);
            filled += n;
        }
        Ok(())
    }

    /// Flush the underlying stream
    pub async fn flush(&mut self) -> ShareResult<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the underlying stream
    pub async fn shutdown(&mut self) -> ShareResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Recover the raw stream
    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn read_frame(&mut self) -> ShareResult<Vec<u8>> {
        let len = self.stream.read_u32().await? as usize;
        if !(NONCE_SIZE + TAG_SIZE..=MAX_SEALED_FRAME).contains(&len) {
            return Err(ShareError::Protocol(format!(
                "encrypted frame length {} out of range",
                len
            )));
        }

        let mut sealed = vec![0u8; len];
        self.stream.read_exact(&mut sealed).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ShareError::DecryptionFailed("truncated encrypted frame".to_string())
            } else {
                ShareError::Io(e)
            }
        })?;

        self.cipher.open(&sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(key: [u8; 32], other: [u8; 32]) -> (
        EncryptedChannel<tokio::io::DuplexStream>,
        EncryptedChannel<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(1024 * 1024);
        (
            EncryptedChannel::new(a, ChannelCipher::new(&key)),
            EncryptedChannel::new(b, ChannelCipher::new(&other)),
        )
    }

    #[tokio::test]
    async fn test_large_write_is_chunked_and_reassembled() {
        let key = ChannelCipher::generate_key();
        let (mut tx, mut rx) = pair(key, key);

        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            tx.write_all(&data).await.unwrap();
            tx.flush().await.unwrap();
            tx
        });

        // Read in odd-sized pieces to cross frame boundaries
        let mut received = Vec::new();
        let mut remaining = expected.len();
        while remaining > 0 {
            let n = remaining.min(7_919);
            let mut buf = vec![0u8; n];
            rx.read_exact(&mut buf).await.unwrap();
            received.extend_from_slice(&buf);
            remaining -= n;
        }
        writer.await.unwrap();

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_wrong_key_fails_closed() {
        let (mut tx, mut rx) = pair(ChannelCipher::generate_key(), ChannelCipher::generate_key());

        tx.write_all(b"secret").await.unwrap();
        let mut buf = [0u8; 6];
        assert!(matches!(
            rx.read_exact(&mut buf).await,
            Err(ShareError::DecryptionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_fails() {
        let key = ChannelCipher::generate_key();
        let (mut raw, b) = tokio::io::duplex(1024);
        let mut rx = EncryptedChannel::new(b, ChannelCipher::new(&key));

        let sealed = ChannelCipher::new(&key).seal(b"hello").unwrap();
        raw.write_u32(sealed.len() as u32).await.unwrap();
        raw.write_all(&sealed[..sealed.len() - 3]).await.unwrap();
        drop(raw);

        let mut buf = [0u8; 5];
        assert!(matches!(
            rx.read_exact(&mut buf).await,
            Err(ShareError::DecryptionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let key = ChannelCipher::generate_key();
        let (mut raw, b) = tokio::io::duplex(1024);
        let mut rx = EncryptedChannel::new(b, ChannelCipher::new(&key));

        raw.write_u32(u32::MAX).await.unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(
            rx.read_exact(&mut buf).await,
            Err(ShareError::Protocol(_))
        ));
    }
}
