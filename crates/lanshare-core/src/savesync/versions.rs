//! On-disk version store for monitored save directories
//!
//! ```text
//! <data_dir>/saves/<save id>/
//!   versions/<n>/...            full copy of version n
//!   discarded/<ts>-<label>/...  side dropped by a conflict resolution
//!   remote/<ts>/...             remote copy kept by keep-both
//! ```
//!
//! All functions here are blocking.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::types::SaveVersion;
use crate::error::{ShareError, ShareResult};
use crate::storage::Storage;
use crate::transfer::manifest::safe_item_name;
use crate::transfer::{Manifest, STAGING_DIR};

/// Content summary of a directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub content_hash: String,
    pub size: u64,
    pub file_count: u64,
}

impl Snapshot {
    /// Hash the directory's manifest. A missing directory is empty.
    pub fn of(dir: &Path) -> ShareResult<Self> {
        let manifest = if dir.exists() {
            Manifest::build(dir, None)?.0
        } else {
            Manifest::default()
        };
        Ok(Self {
            content_hash: manifest.content_hash()?,
            size: manifest.total_bytes,
            file_count: manifest.total_files,
        })
    }
}

/// Versioned copies and bounded retention
#[derive(Debug, Clone)]
pub struct VersionStore {
    root: PathBuf,
    storage: Storage,
    max_versions: usize,
}

impl VersionStore {
    pub fn new(root: impl Into<PathBuf>, storage: Storage, max_versions: usize) -> Self {
        Self {
            root: root.into(),
            storage,
            max_versions: max_versions.max(1),
        }
    }

    fn save_root(&self, save_id: &str) -> ShareResult<PathBuf> {
        Ok(self.root.join(safe_item_name(save_id)?))
    }

    pub fn version_dir(&self, save_id: &str, version: u64) -> ShareResult<PathBuf> {
        Ok(self.save_root(save_id)?.join("versions").join(version.to_string()))
    }

    /// Copy `source` into the version directory, record the metadata and
    /// prune the oldest versions beyond the cap.
    pub fn store(&self, source: &Path, version: &SaveVersion) -> ShareResult<()> {
        let target = self.version_dir(&version.save_id, version.version)?;
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }
        copy_tree(source, &target)?;
        self.storage.save_save_version(version)?;
        debug!(save_id = %version.save_id, version = version.version, "Stored save version");
        self.prune(&version.save_id)?;
        Ok(())
    }

    /// Versions of a save, oldest first
    pub fn list(&self, save_id: &str) -> ShareResult<Vec<SaveVersion>> {
        self.storage.list_save_versions(save_id)
    }

    pub fn latest(&self, save_id: &str) -> ShareResult<Option<SaveVersion>> {
        Ok(self.list(save_id)?.pop())
    }

    pub fn get(&self, save_id: &str, version: u64) -> ShareResult<Option<SaveVersion>> {
        Ok(self
            .list(save_id)?
            .into_iter()
            .find(|v| v.version == version))
    }

    /// Delete versions beyond the retention cap, oldest first.
    pub fn prune(&self, save_id: &str) -> ShareResult<usize> {
        let versions = self.list(save_id)?;
        let excess = versions.len().saturating_sub(self.max_versions);
        for version in versions.iter().take(excess) {
            let dir = self.version_dir(save_id, version.version)?;
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(dir = ?dir, error = %e, "Could not delete pruned version"),
            }
            self.storage.delete_save_version(save_id, version.version)?;
        }
        if excess > 0 {
            info!(save_id, pruned = excess, kept = self.max_versions, "Pruned old save versions");
        }
        Ok(excess)
    }

    /// Replace the contents of `target` with a stored version.
    pub fn restore(&self, save_id: &str, version: u64, target: &Path) -> ShareResult<()> {
        let source = self.version_dir(save_id, version)?;
        if !source.is_dir() {
            return Err(ShareError::NotFound(format!("{} version {}", save_id, version)));
        }
        replace_tree(&source, target)
    }

    /// Copy the side about to be discarded to a timestamped backup.
    pub fn backup(&self, save_id: &str, source: &Path, label: &str) -> ShareResult<PathBuf> {
        let target = self.discarded_dir(save_id, label)?;
        copy_tree(source, &target)?;
        info!(save_id, backup = ?target, "Backed up discarded save data");
        Ok(target)
    }

    /// Fresh timestamped directory for discarded data
    pub fn discarded_dir(&self, save_id: &str, label: &str) -> ShareResult<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        Ok(self
            .save_root(save_id)?
            .join("discarded")
            .join(format!("{}-{}", stamp, label)))
    }

    /// Directory for a remote copy kept beside the local one
    pub fn remote_copy_dir(&self, save_id: &str) -> ShareResult<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        Ok(self.save_root(save_id)?.join("remote").join(stamp.to_string()))
    }
}

/// Recursively copy `from` into `to` (created). Staging leftovers are skipped.
pub fn copy_tree(from: &Path, to: &Path) -> ShareResult<()> {
    std::fs::create_dir_all(to)?;
    if !from.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(root = ?from, error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| ShareError::InvalidOperation(e.to_string()))?;
        if relative.starts_with(STAGING_DIR) {
            continue;
        }
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Make `target` hold exactly the contents of `source`.
pub fn replace_tree(source: &Path, target: &Path) -> ShareResult<()> {
    if target.exists() {
        for entry in std::fs::read_dir(target)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
    }
    copy_tree(source, target)
}
