//! Save-sync data types

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::error::ShareResult;

/// Bookkeeping for one monitored save directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveState {
    pub save_id: String,
    pub path: PathBuf,
    pub clock: VectorClock,
    /// Content hash of the most recent version, if any
    pub last_hash: Option<String>,
    /// Number the next version will get
    pub next_version: u64,
}

impl SaveState {
    pub fn new(save_id: impl Into<String>, path: PathBuf) -> Self {
        Self {
            save_id: save_id.into(),
            path,
            clock: VectorClock::new(),
            last_hash: None,
            next_version: 1,
        }
    }
}

/// Immutable snapshot descriptor of a save directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveVersion {
    pub save_id: String,
    pub version: u64,
    pub content_hash: String,
    pub size: u64,
    pub file_count: u64,
    pub clock: VectorClock,
    pub origin_device: String,
    pub created_at: DateTime<Utc>,
}

/// A version as announced to peers over discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOffer {
    pub save_id: String,
    pub content_hash: String,
    pub size: u64,
    pub file_count: u64,
    pub clock: VectorClock,
    pub version: u64,
    pub origin_device: String,
    pub created_at: DateTime<Utc>,
}

impl SyncOffer {
    pub fn from_version(version: &SaveVersion) -> Self {
        Self {
            save_id: version.save_id.clone(),
            content_hash: version.content_hash.clone(),
            size: version.size,
            file_count: version.file_count,
            clock: version.clock.clone(),
            version: version.version,
            origin_device: version.origin_device.clone(),
            created_at: version.created_at,
        }
    }

    /// Encode as a discovery `save_sync_payload`
    pub fn to_payload(&self) -> ShareResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_payload(payload: &serde_json::Value) -> ShareResult<Self> {
        Ok(serde_json::from_value(payload.clone())?)
    }
}

/// Local and remote versions changed independently
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    pub save_id: String,
    pub local: SaveVersion,
    pub remote: SyncOffer,
    /// Transfer address of the peer holding the remote version
    pub peer: SocketAddr,
    pub detected_at: DateTime<Utc>,
}

/// How to settle a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Resolution {
    KeepLocal,
    UseRemote,
    /// Keep local in place and store the remote contents as a sibling copy
    KeepBoth,
    LastWriterWins,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::KeepLocal => "keep-local",
            Resolution::UseRemote => "use-remote",
            Resolution::KeepBoth => "keep-both",
            Resolution::LastWriterWins => "last-writer-wins",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Resolution {
    type Err = crate::error::ShareError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep-local" => Ok(Resolution::KeepLocal),
            "use-remote" => Ok(Resolution::UseRemote),
            "keep-both" => Ok(Resolution::KeepBoth),
            "last-writer-wins" | "lww" => Ok(Resolution::LastWriterWins),
            other => Err(crate::error::ShareError::InvalidOperation(format!(
                "unknown resolution {:?}",
                other
            ))),
        }
    }
}

/// Which side's contents ended up in the save directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Local,
    Remote,
}

/// Result of `resolve_conflict`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionOutcome {
    pub conflict_id: String,
    pub resolution: Resolution,
    pub winner: Side,
    /// Last-writer-wins fell back to wall-clock time
    pub unreliable: bool,
    /// Backup of the discarded side, when one was written
    pub backup: Option<PathBuf>,
    /// Version now current for the save
    pub version: SaveVersion,
}

/// What `handle_offer` concluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferDecision {
    /// Remote is strictly newer; see `apply_update`
    UpdateAvailable,
    /// Local is newer or identical
    Ignored,
    Conflict(Conflict),
}

/// Notifications from the save-sync service
#[derive(Debug, Clone)]
pub enum SaveSyncEvent {
    VersionCreated(SaveVersion),
    OfferSent { save_id: String, peers: usize },
    UpdateAvailable { offer: SyncOffer, peer: SocketAddr },
    UpdateApplied(SaveVersion),
    ConflictDetected(Conflict),
    ConflictResolved(ResolutionOutcome),
    Restored { save_id: String, version: u64 },
    SyncFailed { save_id: String, error: String },
}

impl fmt::Display for SaveSyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveSyncEvent::VersionCreated(v) => {
                write!(f, "{} v{} created ({})", v.save_id, v.version, v.clock)
            }
            SaveSyncEvent::OfferSent { save_id, peers } => {
                write!(f, "{} offered to {} peers", save_id, peers)
            }
            SaveSyncEvent::UpdateAvailable { offer, peer } => {
                write!(f, "{} update available from {}", offer.save_id, peer)
            }
            SaveSyncEvent::UpdateApplied(v) => write!(f, "{} updated to v{}", v.save_id, v.version),
            SaveSyncEvent::ConflictDetected(c) => {
                write!(f, "{} conflict {} with {}", c.save_id, c.id, c.peer)
            }
            SaveSyncEvent::ConflictResolved(o) => {
                write!(f, "conflict {} resolved ({})", o.conflict_id, o.resolution)
            }
            SaveSyncEvent::Restored { save_id, version } => {
                write!(f, "{} restored to v{}", save_id, version)
            }
            SaveSyncEvent::SyncFailed { save_id, error } => {
                write!(f, "{} sync failed: {}", save_id, error)
            }
        }
    }
}
