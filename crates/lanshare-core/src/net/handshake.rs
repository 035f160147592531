//! Pre-shared-key challenge/response
//!
//! ```text
//! Initiator                              Responder
//!   |--- seal{device_id, challenge} ------->|  decrypt fails => wrong key
//!   |<-- seal{device_id, reverse(chal)} ----|
//!   |  verify reversal                      |
//! ```
//!
//! Both messages are single `[len: u32 BE][sealed]` frames. Nothing else is
//! exchanged until the handshake has succeeded on both sides.

use std::time::Duration;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::crypto::ChannelCipher;
use crate::error::{ShareError, ShareResult};

/// Challenge length in bytes
pub const CHALLENGE_SIZE: usize = 32;

/// Handshake frames are tiny; anything larger is hostile
const MAX_HANDSHAKE_FRAME: usize = 4 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct HandshakeMessage {
    device_id: String,
    challenge: [u8; CHALLENGE_SIZE],
}

/// What each side learns from a successful handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOutcome {
    /// Device identifier claimed by the remote side
    pub peer_device_id: String,
}

/// Run the initiator side.
pub async fn initiate<S>(
    stream: &mut S,
    cipher: &ChannelCipher,
    device_id: &str,
    timeout: Duration,
) -> ShareResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(timeout, async {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        rand::rng().fill_bytes(&mut challenge);

        let hello = HandshakeMessage {
            device_id: device_id.to_string(),
            challenge,
        };
        write_sealed(stream, cipher, &hello).await?;

        let reply = match read_sealed(stream, cipher).await {
            Ok(reply) => reply,
            // The responder hangs up when it cannot decrypt our hello
            Err(ShareError::Transport(_)) => {
                return Err(ShareError::Authentication(
                    "peer closed the connection during handshake (shared key mismatch?)".into(),
                ))
            }
            Err(e) => return Err(e),
        };

        let mut expected = challenge;
        expected.reverse();
        if reply.challenge != expected {
            warn!(peer = %reply.device_id, "Handshake challenge reversal mismatch");
            return Err(ShareError::Authentication(
                "challenge response did not match".into(),
            ));
        }

        debug!(peer = %reply.device_id, "Handshake complete (initiator)");
        Ok(HandshakeOutcome {
            peer_device_id: reply.device_id,
        })
    })
    .await
}

/// Run the responder side.
pub async fn respond<S>(
    stream: &mut S,
    cipher: &ChannelCipher,
    device_id: &str,
    timeout: Duration,
) -> ShareResult<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    with_timeout(timeout, async {
        let hello = read_sealed(stream, cipher).await?;

        let mut reversed = hello.challenge;
        reversed.reverse();
        let reply = HandshakeMessage {
            device_id: device_id.to_string(),
            challenge: reversed,
        };
        write_sealed(stream, cipher, &reply).await?;

        debug!(peer = %hello.device_id, "Handshake complete (responder)");
        Ok(HandshakeOutcome {
            peer_device_id: hello.device_id,
        })
    })
    .await
}

async fn with_timeout<F>(timeout: Duration, fut: F) -> ShareResult<HandshakeOutcome>
where
    F: std::future::Future<Output = ShareResult<HandshakeOutcome>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ShareError::Timeout(format!("handshake did not finish within {:?}", timeout)))?
}

async fn write_sealed<S>(
    stream: &mut S,
    cipher: &ChannelCipher,
    message: &HandshakeMessage,
) -> ShareResult<()>
where
    S: AsyncWrite + Unpin,
{
    let plaintext = postcard::to_allocvec(message)?;
    let sealed = cipher.seal(&plaintext)?;
    let mut frame = Vec::with_capacity(4 + sealed.len());
    frame.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
    frame.extend_from_slice(&sealed);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_sealed<S>(stream: &mut S, cipher: &ChannelCipher) -> ShareResult<HandshakeMessage>
where
    S: AsyncRead + Unpin,
{
    let eof = |e: std::io::Error| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ShareError::Transport("connection closed during handshake".into())
        } else {
            ShareError::Io(e)
        }
    };

    let len = stream.read_u32().await.map_err(eof)? as usize;
    if len > MAX_HANDSHAKE_FRAME {
        return Err(ShareError::Protocol(format!(
            "handshake frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut sealed = vec![0u8; len];
    stream.read_exact(&mut sealed).await.map_err(eof)?;

    let plaintext = cipher.open(&sealed).map_err(|_| {
        ShareError::Authentication("could not decrypt handshake (shared key mismatch)".into())
    })?;
    postcard::from_bytes(&plaintext)
        .map_err(|e| ShareError::Protocol(format!("malformed handshake message: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_matching_keys_learn_each_other() {
        let key = ChannelCipher::generate_key();
        let (mut a, mut b) = tokio::io::duplex(4096);

        let responder = tokio::spawn(async move {
            respond(&mut b, &ChannelCipher::new(&key), "deck", TIMEOUT).await
        });
        let outcome = initiate(&mut a, &ChannelCipher::new(&key), "desktop", TIMEOUT)
            .await
            .unwrap();

        assert_eq!(outcome.peer_device_id, "deck");
        assert_eq!(responder.await.unwrap().unwrap().peer_device_id, "desktop");
    }

    #[tokio::test]
    async fn test_wrong_key_fails_on_both_sides() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let responder = tokio::spawn(async move {
            respond(&mut b, &ChannelCipher::new(&ChannelCipher::generate_key()), "deck", TIMEOUT)
                .await
        });
        let result = initiate(
            &mut a,
            &ChannelCipher::new(&ChannelCipher::generate_key()),
            "desktop",
            TIMEOUT,
        )
        .await;

        assert!(matches!(result, Err(ShareError::Authentication(_))));
        assert!(matches!(
            responder.await.unwrap(),
            Err(ShareError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_reversal_rejected() {
        let key = ChannelCipher::generate_key();
        let (mut a, mut b) = tokio::io::duplex(4096);

        // Responder that echoes the challenge without reversing it
        let fake = tokio::spawn(async move {
            let cipher = ChannelCipher::new(&key);
            let hello = read_sealed(&mut b, &cipher).await.unwrap();
            write_sealed(&mut b, &cipher, &hello).await.unwrap();
            b
        });

        let result = initiate(&mut a, &ChannelCipher::new(&key), "desktop", TIMEOUT).await;
        assert!(matches!(result, Err(ShareError::Authentication(_))));
        fake.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let key = ChannelCipher::generate_key();
        let (mut a, _b) = tokio::io::duplex(4096);

        let result = initiate(
            &mut a,
            &ChannelCipher::new(&key),
            "desktop",
            Duration::from_secs(60),
        )
        .await;
        assert!(matches!(result, Err(ShareError::Timeout(_))));
    }
}
