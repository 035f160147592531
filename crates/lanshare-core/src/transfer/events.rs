//! Transfer events, results and approval requests

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::ShareError;

/// Which side of a transfer we are
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Receive => write!(f, "receive"),
        }
    }
}

/// An in-flight transfer as listed by `active_transfers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferInfo {
    pub transfer_id: String,
    pub direction: Direction,
    pub peer: SocketAddr,
    pub item_name: String,
    pub total_bytes: u64,
    pub started_at: DateTime<Utc>,
}

/// Counters for one finished transfer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStats {
    /// Files whose bytes crossed the wire
    pub files_transferred: u64,
    /// Files named in the skip list
    pub files_skipped: u64,
    /// File bytes that crossed the wire (uncompressed)
    pub bytes_transferred: u64,
    /// Bytes on the wire including framing and compression
    pub wire_bytes: u64,
    pub elapsed: Duration,
}

/// Result payload of a send or receive; failures carry a diagnostic string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer_id: String,
    pub success: bool,
    pub error: Option<String>,
    /// Files the receiver reported it already had
    pub skipped_files: Vec<String>,
    pub stats: TransferStats,
}

impl TransferResult {
    pub(crate) fn succeeded(
        transfer_id: impl Into<String>,
        skipped_files: Vec<String>,
        stats: TransferStats,
    ) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            success: true,
            error: None,
            skipped_files,
            stats,
        }
    }

    pub(crate) fn failed(transfer_id: impl Into<String>, error: &ShareError) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            success: false,
            error: Some(error.to_string()),
            skipped_files: Vec::new(),
            stats: TransferStats::default(),
        }
    }
}

/// Throughput measured by a speed test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestResult {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl SpeedTestResult {
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.bytes as f64;
        }
        self.bytes as f64 / secs
    }
}

/// Notifications about transfers
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Started(TransferInfo),
    Progress {
        transfer_id: String,
        bytes_done: u64,
        bytes_total: u64,
        current_file: Option<String>,
    },
    Completed {
        transfer_id: String,
        direction: Direction,
        stats: TransferStats,
    },
    Failed {
        transfer_id: String,
        direction: Direction,
        error: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferEvent::Started(info) => write!(
                f,
                "{} {} {} ({} bytes)",
                info.direction, info.transfer_id, info.item_name, info.total_bytes
            ),
            TransferEvent::Progress {
                transfer_id,
                bytes_done,
                bytes_total,
                ..
            } => write!(f, "{}: {}/{} bytes", transfer_id, bytes_done, bytes_total),
            TransferEvent::Completed {
                transfer_id, stats, ..
            } => write!(
                f,
                "{} complete: {} files, {} skipped",
                transfer_id, stats.files_transferred, stats.files_skipped
            ),
            TransferEvent::Failed {
                transfer_id, error, ..
            } => write!(f, "{} failed: {}", transfer_id, error),
        }
    }
}

/// Description of an incoming package awaiting approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingTransfer {
    pub transfer_id: String,
    pub peer: SocketAddr,
    pub peer_device: String,
    pub item_name: String,
    pub total_files: u64,
    pub total_size: u64,
}

/// Approval request handed to the collaborator. Dropping it declines.
#[derive(Debug)]
pub struct ApprovalRequest {
    pub transfer: IncomingTransfer,
    respond: oneshot::Sender<bool>,
}

impl ApprovalRequest {
    pub(crate) fn new(transfer: IncomingTransfer) -> (Self, oneshot::Receiver<bool>) {
        let (respond, rx) = oneshot::channel();
        (Self { transfer, respond }, rx)
    }

    pub fn accept(self) {
        let _ = self.respond.send(true);
    }

    pub fn decline(self) {
        let _ = self.respond.send(false);
    }
}
