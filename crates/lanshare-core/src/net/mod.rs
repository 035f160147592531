//! Stream-level building blocks shared by the transfer protocol
//!
//! - [`bandwidth`]: cooperative token-bucket limiter
//! - [`channel`]: ChaCha20-Poly1305 framing over a byte stream
//! - [`framing`]: length-prefixed postcard frames, plain or encrypted
//! - [`handshake`]: pre-shared-key challenge/response
//! - [`holepunch`]: simultaneous-open TCP through NAT

pub mod bandwidth;
pub mod channel;
pub mod framing;
pub mod handshake;
pub mod holepunch;

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{ShareError, ShareResult};

pub use bandwidth::BandwidthLimiter;
pub use channel::EncryptedChannel;
pub use framing::{FramedStream, MAX_FRAME_SIZE};
pub use handshake::HandshakeOutcome;
pub use holepunch::{estimate_success, NatType, PunchLikelihood, PunchOptions};

/// Run `fut` unless `cancel` fires first.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> ShareResult<T>
where
    F: Future<Output = ShareResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ShareError::Cancelled),
        result = fut => result,
    }
}
