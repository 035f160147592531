//! Symmetric encryption for peer sessions using ChaCha20-Poly1305 AEAD
//!
//! Every peer in a trusted group holds the same 32-byte shared key. The key
//! protects the handshake messages and, once the handshake succeeds, every
//! frame of the encrypted channel.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::ShareError;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size appended to every ciphertext (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Length of the shared key
pub const KEY_SIZE: usize = 32;

/// Domain separation for passphrase-derived keys
const KEY_DERIVATION_INFO: &[u8] = b"lanshare-channel-key-v1";

/// Cipher for sealing and opening session frames.
///
/// # Wire Format
///
/// Sealed data format: `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`
///
/// # Example
///
/// ```
/// use lanshare_core::crypto::ChannelCipher;
///
/// let key = ChannelCipher::generate_key();
/// let cipher = ChannelCipher::new(&key);
///
/// let sealed = cipher.seal(b"Hello, LAN!").unwrap();
/// let opened = cipher.open(&sealed).unwrap();
///
/// assert_eq!(b"Hello, LAN!".as_slice(), opened.as_slice());
/// ```
#[derive(Clone)]
pub struct ChannelCipher {
    cipher: ChaCha20Poly1305,
}

impl std::fmt::Debug for ChannelCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelCipher").finish_non_exhaustive()
    }
}

impl ChannelCipher {
    /// Create a cipher with the given 32-byte key.
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
        }
    }

    /// Generate a new random 32-byte key.
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        key
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt with a fresh random nonce and prepend the nonce.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, ShareError> {
        let nonce_bytes = Self::generate_nonce();
        let ciphertext = self.seal_with_nonce(plaintext, &nonce_bytes)?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by [`seal`](Self::seal).
    ///
    /// Fails on truncated input, wrong key or any modified byte.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, ShareError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(ShareError::DecryptionFailed(format!(
                "sealed frame too short ({} bytes)",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ShareError::DecryptionFailed(e.to_string()))
    }

    /// Encrypt with a caller-provided nonce. The nonce is not prepended.
    pub fn seal_with_nonce(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
    ) -> Result<Vec<u8>, ShareError> {
        self.cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| ShareError::Crypto(format!("Encryption failed: {}", e)))
    }
}

/// Derive a 32-byte key from a passphrase with HKDF-SHA256.
pub fn derive_key(passphrase: &str) -> [u8; KEY_SIZE] {
    let hk = Hkdf::<Sha256>::new(None, passphrase.as_bytes());
    let mut key = [0u8; KEY_SIZE];
    // 32 bytes is always a valid HKDF-SHA256 output length
    let _ = hk.expand(KEY_DERIVATION_INFO, &mut key);
    key
}

/// Parse a configured shared key.
///
/// 64 hex characters are used verbatim, anything else is treated as a
/// passphrase and run through [`derive_key`].
pub fn parse_shared_key(value: &str) -> Result<[u8; KEY_SIZE], ShareError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ShareError::Config("shared key is empty".to_string()));
    }

    if trimmed.len() == KEY_SIZE * 2 && trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(trimmed).map_err(|e| ShareError::Config(e.to_string()))?;
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    Ok(derive_key(trimmed))
}
