//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Transfer resume records (one per in-progress receive)
//! - Per-package hash manifests (skip rehashing unchanged files)
//! - Manually added peers
//! - Save-sync clocks and version metadata
//! - The device identity

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::discovery::ManualPeer;
use crate::error::ShareError;
use crate::savesync::{SaveState, SaveVersion};
use crate::transfer::{PackageHashes, TransferState};

// Table definitions
const TRANSFER_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("transfer_state");
const PACKAGE_HASHES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("package_hashes");
const MANUAL_PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("manual_peers");
const SAVE_STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("save_state");
const SAVE_VERSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("save_versions");
const DEVICE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("device");

const DEVICE_ID_KEY: &str = "device_id";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and all tables if needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ShareError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(TRANSFER_STATE_TABLE)?;
            let _ = write_txn.open_table(PACKAGE_HASHES_TABLE)?;
            let _ = write_txn.open_table(MANUAL_PEERS_TABLE)?;
            let _ = write_txn.open_table(SAVE_STATE_TABLE)?;
            let _ = write_txn.open_table(SAVE_VERSIONS_TABLE)?;
            let _ = write_txn.open_table(DEVICE_TABLE)?;
        }
        write_txn.commit()?;

        info!(?path, "Opened storage");

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Generic JSON helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), ShareError> {
        let data = serde_json::to_vec(value)?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut t = write_txn.open_table(table)?;
            t.insert(key, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, ShareError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let t = read_txn.open_table(table)?;
        match t.get(key)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    fn remove(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<bool, ShareError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existed = {
            let mut t = write_txn.open_table(table)?;
            let removed = t.remove(key)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    fn list<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, ShareError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let t = read_txn.open_table(table)?;

        let mut items = Vec::new();
        for entry in t.iter()? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                continue;
            }
            items.push((key.value().to_string(), serde_json::from_slice(value.value())?));
        }
        Ok(items)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transfer resume records
    // ═══════════════════════════════════════════════════════════════════════

    /// Save (or overwrite) the resume record for a destination.
    pub fn save_transfer_state(&self, key: &str, state: &TransferState) -> Result<(), ShareError> {
        self.put(TRANSFER_STATE_TABLE, key, state)
    }

    /// Load the resume record for a destination.
    pub fn load_transfer_state(&self, key: &str) -> Result<Option<TransferState>, ShareError> {
        self.get(TRANSFER_STATE_TABLE, key)
    }

    /// Delete the resume record for a destination.
    pub fn delete_transfer_state(&self, key: &str) -> Result<bool, ShareError> {
        self.remove(TRANSFER_STATE_TABLE, key)
    }

    /// Discard resume records not updated within `max_age`.
    ///
    /// Returns the destination keys that were removed so callers can clean up
    /// their staging directories.
    pub fn prune_stale_transfer_states(
        &self,
        max_age: chrono::Duration,
    ) -> Result<Vec<String>, ShareError> {
        let cutoff = chrono::Utc::now() - max_age;
        let stale: Vec<String> = self
            .list::<TransferState>(TRANSFER_STATE_TABLE, "")?
            .into_iter()
            .filter(|(_, state)| state.updated_at < cutoff)
            .map(|(key, _)| key)
            .collect();

        if stale.is_empty() {
            return Ok(stale);
        }

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut t = write_txn.open_table(TRANSFER_STATE_TABLE)?;
            for key in &stale {
                t.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;

        info!(count = stale.len(), "Discarded orphaned transfer resume records");
        Ok(stale)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Package hash manifests
    // ═══════════════════════════════════════════════════════════════════════

    /// Store the hash manifest of a package root.
    pub fn save_package_hashes(&self, root: &Path, hashes: &PackageHashes) -> Result<(), ShareError> {
        self.put(PACKAGE_HASHES_TABLE, &root.to_string_lossy(), hashes)
    }

    /// Load the hash manifest of a package root.
    pub fn load_package_hashes(&self, root: &Path) -> Result<Option<PackageHashes>, ShareError> {
        self.get(PACKAGE_HASHES_TABLE, &root.to_string_lossy())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Manual peers
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist a manually added peer.
    pub fn save_manual_peer(&self, peer: &ManualPeer) -> Result<(), ShareError> {
        self.put(MANUAL_PEERS_TABLE, &peer.address.to_string(), peer)
    }

    /// Forget a manually added peer.
    pub fn remove_manual_peer(&self, address: &std::net::SocketAddr) -> Result<bool, ShareError> {
        self.remove(MANUAL_PEERS_TABLE, &address.to_string())
    }

    /// All persisted manual peers.
    pub fn list_manual_peers(&self) -> Result<Vec<ManualPeer>, ShareError> {
        Ok(self
            .list(MANUAL_PEERS_TABLE, "")?
            .into_iter()
            .map(|(_, peer)| peer)
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Save-sync state
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the clock and bookkeeping for a monitored directory.
    pub fn save_save_state(&self, state: &SaveState) -> Result<(), ShareError> {
        self.put(SAVE_STATE_TABLE, &state.save_id, state)
    }

    /// Load the clock and bookkeeping for a monitored directory.
    pub fn load_save_state(&self, save_id: &str) -> Result<Option<SaveState>, ShareError> {
        self.get(SAVE_STATE_TABLE, save_id)
    }

    /// Store version metadata.
    pub fn save_save_version(&self, version: &SaveVersion) -> Result<(), ShareError> {
        self.put(
            SAVE_VERSIONS_TABLE,
            &version_key(&version.save_id, version.version),
            version,
        )
    }

    /// All versions of a save, oldest first.
    pub fn list_save_versions(&self, save_id: &str) -> Result<Vec<SaveVersion>, ShareError> {
        let prefix = format!("{}/", save_id);
        let mut versions: Vec<SaveVersion> = self
            .list(SAVE_VERSIONS_TABLE, &prefix)?
            .into_iter()
            .map(|(_, v)| v)
            .collect();
        versions.sort_by_key(|v: &SaveVersion| v.version);
        Ok(versions)
    }

    /// Delete version metadata.
    pub fn delete_save_version(&self, save_id: &str, version: u64) -> Result<bool, ShareError> {
        debug!(save_id, version, "Deleting save version record");
        self.remove(SAVE_VERSIONS_TABLE, &version_key(save_id, version))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Device identity
    // ═══════════════════════════════════════════════════════════════════════

    /// The persisted device identifier, if one was saved.
    pub fn load_device_id(&self) -> Result<Option<String>, ShareError> {
        self.get(DEVICE_TABLE, DEVICE_ID_KEY)
    }

    /// Persist the device identifier.
    pub fn save_device_id(&self, device_id: &str) -> Result<(), ShareError> {
        self.put(DEVICE_TABLE, DEVICE_ID_KEY, &device_id)
    }
}

fn version_key(save_id: &str, version: u64) -> String {
    format!("{}/{:010}", save_id, version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    fn storage(temp: &TempDir) -> Storage {
        Storage::new(temp.path().join("db").join("test.redb")).unwrap()
    }

    fn transfer_state(updated_at: chrono::DateTime<chrono::Utc>) -> TransferState {
        TransferState {
            transfer_id: "t1".into(),
            item_name: "Game".into(),
            manifest_hash: "abc".into(),
            total_files: 2,
            total_bytes: 10,
            completed_files: BTreeSet::new(),
            received_bytes: 0,
            started_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn test_transfer_state_crud() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);

        let state = transfer_state(chrono::Utc::now());
        storage.save_transfer_state("/dest/Game", &state).unwrap();
        assert_eq!(storage.load_transfer_state("/dest/Game").unwrap(), Some(state));

        assert!(storage.delete_transfer_state("/dest/Game").unwrap());
        assert!(storage.load_transfer_state("/dest/Game").unwrap().is_none());
        assert!(!storage.delete_transfer_state("/dest/Game").unwrap());
    }

    #[test]
    fn test_prune_stale_transfer_states() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);

        let old = transfer_state(chrono::Utc::now() - chrono::Duration::hours(30));
        let fresh = transfer_state(chrono::Utc::now());
        storage.save_transfer_state("old", &old).unwrap();
        storage.save_transfer_state("fresh", &fresh).unwrap();

        let removed = storage
            .prune_stale_transfer_states(chrono::Duration::hours(24))
            .unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(storage.load_transfer_state("fresh").unwrap().is_some());
    }

    #[test]
    fn test_save_versions_sorted_and_scoped() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);

        for (save_id, version) in [("a", 10), ("a", 2), ("ab", 1)] {
            storage
                .save_save_version(&SaveVersion {
                    save_id: save_id.into(),
                    version,
                    content_hash: format!("h{}", version),
                    size: 0,
                    file_count: 0,
                    clock: VectorClock::new(),
                    origin_device: "dev".into(),
                    created_at: chrono::Utc::now(),
                })
                .unwrap();
        }

        let versions = storage.list_save_versions("a").unwrap();
        let numbers: Vec<u64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![2, 10]);

        storage.delete_save_version("a", 2).unwrap();
        assert_eq!(storage.list_save_versions("a").unwrap().len(), 1);
    }

    #[test]
    fn test_device_id_roundtrip() {
        let temp = TempDir::new().unwrap();
        let storage = storage(&temp);

        assert!(storage.load_device_id().unwrap().is_none());
        storage.save_device_id("dev-1").unwrap();
        assert_eq!(storage.load_device_id().unwrap().as_deref(), Some("dev-1"));
    }
}
