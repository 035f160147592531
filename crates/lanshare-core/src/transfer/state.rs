//! Persisted resume records for incoming transfers
//!
//! One record exists per destination directory while a receive is in
//! progress. It is updated after every verified file and deleted once the
//! package has been moved into place. A record only applies to a retry whose
//! manifest hash is identical; otherwise it is discarded.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::manifest::{safe_relative_path, Manifest};

/// Resume record for one destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferState {
    pub transfer_id: String,
    pub item_name: String,
    /// Content hash of the manifest this record belongs to
    pub manifest_hash: String,
    pub total_files: u64,
    pub total_bytes: u64,
    /// Relative paths verified and staged so far
    pub completed_files: BTreeSet<String>,
    pub received_bytes: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferState {
    /// Fresh record for a manifest
    pub fn new(
        transfer_id: impl Into<String>,
        item_name: impl Into<String>,
        manifest: &Manifest,
        manifest_hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: transfer_id.into(),
            item_name: item_name.into(),
            manifest_hash: manifest_hash.into(),
            total_files: manifest.total_files,
            total_bytes: manifest.total_bytes,
            completed_files: BTreeSet::new(),
            received_bytes: 0,
            started_at: now,
            updated_at: now,
        }
    }

    /// Record one verified file
    pub fn mark_completed(&mut self, path: &str, size: u64) {
        if self.completed_files.insert(path.to_string()) {
            self.received_bytes += size;
        }
        self.updated_at = Utc::now();
    }

    pub fn is_complete(&self) -> bool {
        self.completed_files.len() as u64 == self.total_files
    }
}

/// Outcome of comparing a stored record against an incoming manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeDecision {
    /// No record: start fresh
    Fresh,
    /// Same manifest: these files are already staged and verified
    Resume(BTreeSet<String>),
    /// Manifest changed since the record was written: drop it and start fresh
    Discard,
}

/// Decide how to treat a stored record for an incoming manifest.
///
/// Completed files whose staged copy is missing or has the wrong size are
/// received again.
pub fn plan_resume(
    stored: Option<&TransferState>,
    manifest: &Manifest,
    manifest_hash: &str,
    staging_dir: &Path,
) -> ResumeDecision {
    let Some(state) = stored else {
        return ResumeDecision::Fresh;
    };
    if state.manifest_hash != manifest_hash {
        return ResumeDecision::Discard;
    }

    let index = manifest.index();
    let staged = state
        .completed_files
        .iter()
        .filter(|path| {
            let Some(entry) = index.get(path.as_str()) else {
                return false;
            };
            let Ok(relative) = safe_relative_path(path) else {
                return false;
            };
            std::fs::metadata(staging_dir.join(relative))
                .map(|m| m.is_file() && m.len() == entry.size)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    ResumeDecision::Resume(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::manifest::ManifestEntry;
    use tempfile::TempDir;

    fn manifest() -> Manifest {
        Manifest::from_entries(vec![
            ManifestEntry {
                path: "a.txt".into(),
                size: 2,
                hash: "h1".into(),
            },
            ManifestEntry {
                path: "b.bin".into(),
                size: 4,
                hash: "h2".into(),
            },
        ])
    }

    #[test]
    fn test_mark_completed_counts_once() {
        let m = manifest();
        let mut state = TransferState::new("t", "Game", &m, "mh");
        state.mark_completed("a.txt", 2);
        state.mark_completed("a.txt", 2);
        assert_eq!(state.received_bytes, 2);
        assert!(!state.is_complete());
        state.mark_completed("b.bin", 4);
        assert!(state.is_complete());
    }

    #[test]
    fn test_plan_resume() {
        let temp = TempDir::new().unwrap();
        let m = manifest();
        let mut state = TransferState::new("t", "Game", &m, "mh");
        state.mark_completed("a.txt", 2);
        state.mark_completed("b.bin", 4);

        // Only a.txt is actually staged with the right size
        std::fs::write(temp.path().join("a.txt"), "hi").unwrap();
        std::fs::write(temp.path().join("b.bin"), "x").unwrap();

        assert_eq!(plan_resume(None, &m, "mh", temp.path()), ResumeDecision::Fresh);
        assert_eq!(
            plan_resume(Some(&state), &m, "other", temp.path()),
            ResumeDecision::Discard
        );
        assert_eq!(
            plan_resume(Some(&state), &m, "mh", temp.path()),
            ResumeDecision::Resume(["a.txt".to_string()].into_iter().collect())
        );
    }
}
