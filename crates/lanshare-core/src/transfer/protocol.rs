//! Transfer wire protocol
//!
//! Every structured message is one length-prefixed postcard frame (see
//! [`FramedStream`](crate::net::FramedStream)).
//!
//! ## Package flow
//!
//! ```text
//! Sender                                   Receiver
//!   |--- TransferHeader ------------------->|
//!   |--- Manifest ------------------------->|  approval, space check,
//!   |<-- Ack {accepted, skipped_files} -----|  skip set
//!   |=== file bytes (non-skipped, ordered) =>|  verify each hash
//!   |<-- Completion {success} --------------|
//! ```
//!
//! File bytes are raw with [`CompressionMode::None`]; with
//! [`CompressionMode::Zstd`] each file is a sequence of frames, each one
//! zstd-compressed block of at most [`ZSTD_BLOCK_SIZE`] bytes.
//!
//! ## Auxiliary flows
//!
//! - `ListRequest`: header + empty manifest, answered with a [`LibraryCatalog`].
//! - `SpeedTest`: header, `total_size` filler bytes, answered with a
//!   [`Completion`].
//! - `SaveRequest`: header naming a save id, answered with an [`Ack`]; when
//!   accepted the responder then runs the package flow as the sender on the
//!   same connection.
//!
//! ## Resume (protocol version 2)
//!
//! Files the receiver already completed under a matching resume record are
//! listed in the ack's skip set together with files it already holds, and the
//! sender never transmits skipped files.

use serde::{Deserialize, Serialize};

use crate::config::CompressionMode;
use crate::error::{ShareError, ShareResult};

/// "LSHR"
pub const TRANSFER_MAGIC: u32 = 0x4C53_4852;

/// Protocol version; resume skips are honoured by the sender
pub const PROTOCOL_VERSION: u16 = 2;

/// Uncompressed size of one zstd block
pub const ZSTD_BLOCK_SIZE: usize = 1024 * 1024;

/// Raw file bytes are written in chunks of this size
pub const FILE_CHUNK_SIZE: usize = 256 * 1024;

/// Largest speed test a receiver will sink
pub const MAX_SPEED_TEST_BYTES: u64 = 1024 * 1024 * 1024;

/// zstd level used for outgoing blocks
pub const ZSTD_LEVEL: i32 = 3;

/// What a connection is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferType {
    /// Push a directory tree
    Package,
    /// Ask for the peer's catalog
    ListRequest,
    /// Measure throughput with filler bytes
    SpeedTest,
    /// Pull the current contents of a monitored save directory
    SaveRequest,
}

/// First frame of every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub magic: u32,
    pub version: u16,
    pub transfer_type: TransferType,
    /// Identifier shared by both ends for events and cancellation
    pub transfer_id: String,
    pub sender_device: String,
    /// Package name, or save id for `SaveRequest`
    pub item_name: String,
    pub total_files: u64,
    pub total_size: u64,
    pub compression: CompressionMode,
}

impl TransferHeader {
    pub fn new(
        transfer_type: TransferType,
        transfer_id: impl Into<String>,
        sender_device: impl Into<String>,
        item_name: impl Into<String>,
    ) -> Self {
        Self {
            magic: TRANSFER_MAGIC,
            version: PROTOCOL_VERSION,
            transfer_type,
            transfer_id: transfer_id.into(),
            sender_device: sender_device.into(),
            item_name: item_name.into(),
            total_files: 0,
            total_size: 0,
            compression: CompressionMode::None,
        }
    }

    /// Reject foreign or incompatible peers before anything else is read.
    pub fn validate(&self) -> ShareResult<()> {
        if self.magic != TRANSFER_MAGIC {
            return Err(ShareError::Protocol(format!(
                "bad magic {:#010x}",
                self.magic
            )));
        }
        if self.version != PROTOCOL_VERSION {
            return Err(ShareError::Protocol(format!(
                "unsupported protocol version {} (expected {})",
                self.version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

/// Receiver's answer to a header + manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: bool,
    /// Files the sender must not transmit
    pub skipped_files: Vec<String>,
    /// Why the transfer was declined
    pub reason: Option<String>,
}

impl Ack {
    pub fn accept(skipped_files: Vec<String>) -> Self {
        Self {
            accepted: true,
            skipped_files,
            reason: None,
        }
    }

    pub fn decline(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            skipped_files: Vec::new(),
            reason: Some(reason.into()),
        }
    }
}

/// Final frame of a package or speed test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub success: bool,
    pub message: Option<String>,
}

impl Completion {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

/// One entry of a peer's library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryItem {
    pub name: String,
    pub size: u64,
    pub file_count: u64,
}

/// Reply to a `ListRequest`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryCatalog {
    pub items: Vec<LibraryItem>,
}

/// Compress one block for the wire
pub fn compress_block(block: &[u8]) -> ShareResult<Vec<u8>> {
    Ok(zstd::bulk::compress(block, ZSTD_LEVEL)?)
}

/// Decompress one block, refusing anything larger than a block
pub fn decompress_block(frame: &[u8]) -> ShareResult<Vec<u8>> {
    zstd::bulk::decompress(frame, ZSTD_BLOCK_SIZE)
        .map_err(|e| ShareError::Protocol(format!("corrupt compressed block: {}", e)))
}

/// Upper bound for one compressed block frame
pub fn max_compressed_frame() -> usize {
    zstd::zstd_safe::compress_bound(ZSTD_BLOCK_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_validation() {
        let header = TransferHeader::new(TransferType::Package, "t", "dev", "Game");
        header.validate().unwrap();

        let mut bad = header.clone();
        bad.magic = 0xDEAD_BEEF;
        assert!(matches!(bad.validate(), Err(ShareError::Protocol(_))));

        let mut old = header;
        old.version = 1;
        assert!(matches!(old.validate(), Err(ShareError::Protocol(_))));
    }

    #[test]
    fn test_magic_spells_lshr() {
        assert_eq!(&TRANSFER_MAGIC.to_be_bytes(), b"LSHR");
    }

    #[test]
    fn test_block_compression() {
        let block = vec![0u8; ZSTD_BLOCK_SIZE];
        let compressed = compress_block(&block).unwrap();
        assert!(compressed.len() < block.len());
        assert!(compressed.len() <= max_compressed_frame());
        assert_eq!(decompress_block(&compressed).unwrap(), block);
    }

    #[test]
    fn test_oversized_block_rejected() {
        let block = vec![1u8; ZSTD_BLOCK_SIZE + 1];
        let compressed = compress_block(&block).unwrap();
        assert!(matches!(
            decompress_block(&compressed),
            Err(ShareError::Protocol(_))
        ));
    }
}
