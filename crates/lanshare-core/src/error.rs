//! Error types for lanshare

use std::io;

use thiserror::Error;

/// Main error type for lanshare operations
///
/// Variants follow the failure classes the protocols distinguish: transport
/// failures may be retried, protocol and integrity failures abort the session,
/// authorization failures reject cleanly before any data is exchanged.
#[derive(Error, Debug)]
pub enum ShareError {
    /// Connection refused/reset/timed out or other socket-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Bad magic, unsupported version, malformed or oversized frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Content hash did not match the manifest
    #[error("Integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        /// Relative path of the offending file
        path: String,
        /// Hash announced in the manifest
        expected: String,
        /// Hash computed over the received bytes
        actual: String,
    },

    /// Remote declined, or approval timed out
    #[error("Transfer declined: {0}")]
    Declined(String),

    /// Handshake proved the peer holds a different key
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Not enough disk space or no write permission
    #[error("Insufficient resources: {0}")]
    Resource(String),

    /// Payload too large for the discovery transport
    #[error("Payload of {size} bytes exceeds the {limit} byte datagram limit")]
    PayloadTooLarge {
        /// Encoded size of the rejected payload
        size: usize,
        /// Maximum accepted size
        limit: usize,
    },

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Decryption failed (wrong key, tampered data, or truncated frame)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Invalid or inconsistent configuration
    #[error("Config error: {0}")]
    Config(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Operation was cancelled by its caller
    #[error("Operation cancelled")]
    Cancelled,

    /// A bounded wait elapsed
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl ShareError {
    /// Whether the error is one of the transport failures expected while a
    /// peer is not yet listening (refused, reset, timed out).
    pub fn is_transient(&self) -> bool {
        match self {
            ShareError::Timeout(_) => true,
            ShareError::Io(e) => is_transient_io(e.kind()),
            _ => false,
        }
    }
}

/// Socket error kinds that are retried rather than reported.
pub fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}

impl From<postcard::Error> for ShareError {
    fn from(e: postcard::Error) -> Self {
        ShareError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(e: serde_json::Error) -> Self {
        ShareError::Serialization(e.to_string())
    }
}

/// Result type alias using ShareError
pub type ShareResult<T> = Result<T, ShareError>;
