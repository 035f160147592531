//! Resumable package transfer over TCP
//!
//! A package is a directory tree (or one file) described by a [`Manifest`]
//! of relative paths, sizes and BLAKE3 hashes. The receiver verifies every
//! file against the manifest, keeps a [`TransferState`] so an interrupted
//! transfer resumes where it stopped, and tells the sender which files it can
//! skip. See [`protocol`] for the wire flow.

pub mod catalog;
pub mod events;
pub mod manifest;
pub mod protocol;
mod receiver;
mod sender;
pub mod service;
pub mod state;

pub use events::{
    ApprovalRequest, Direction, IncomingTransfer, SpeedTestResult, TransferEvent, TransferInfo,
    TransferResult, TransferStats,
};
pub use manifest::{FileFingerprint, Manifest, ManifestEntry, PackageHashes};
pub use protocol::{LibraryCatalog, LibraryItem, TransferHeader, TransferType};
pub use receiver::STAGING_DIR;
pub use service::{SaveProvider, TransferService};
pub use state::{ResumeDecision, TransferState};

use crate::error::{ShareError, ShareResult};

/// Run blocking filesystem work off the async runtime.
pub(crate) async fn run_blocking<T, F>(f: F) -> ShareResult<T>
where
    F: FnOnce() -> ShareResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShareError::InvalidOperation(format!("blocking task failed: {}", e)))?
}
