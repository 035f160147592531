//! Transfer manifests and content hashing
//!
//! A manifest lists every file of a package tree in a stable order with its
//! size and BLAKE3 hash. [`PackageHashes`] remembers the hash of each file
//! together with its size and modification time so unchanged files are not
//! rehashed on the next transfer.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ShareError, ShareResult};

/// Read buffer for hashing (1 MiB)
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// One file of a package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the package root, `/`-separated
    pub path: String,
    pub size: u64,
    /// BLAKE3 hash, lowercase hex
    pub hash: String,
}

/// Ordered file list plus totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    pub total_files: u64,
    pub total_bytes: u64,
}

impl Manifest {
    /// Manifest from entries, computing the totals
    pub fn from_entries(entries: Vec<ManifestEntry>) -> Self {
        // Saturates so an impossible total still fails `validate`
        let total_bytes = entries
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.size));
        Self {
            total_files: entries.len() as u64,
            total_bytes,
            entries,
        }
    }

    /// Walk and hash `root`, reusing hashes from `cache` for files whose size
    /// and mtime are unchanged. Returns the manifest and the refreshed cache.
    ///
    /// `root` may be a directory or a single file. Blocking.
    pub fn build(root: &Path, cache: Option<&PackageHashes>) -> ShareResult<(Manifest, PackageHashes)> {
        let mut entries = Vec::new();
        let mut hashes = PackageHashes::default();
        let mut reused = 0usize;

        let files: Vec<(String, PathBuf)> = if root.is_file() {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| ShareError::InvalidOperation(format!("{} has no file name", root.display())))?;
            vec![(name, root.to_path_buf())]
        } else if root.is_dir() {
            let mut files = Vec::new();
            for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(root = ?root, error = %e, "Skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(root)
                    .map_err(|e| ShareError::InvalidOperation(e.to_string()))?;
                files.push((to_wire_path(relative), entry.path().to_path_buf()));
            }
            files
        } else {
            return Err(ShareError::NotFound(root.display().to_string()));
        };

        for (relative, path) in files {
            let metadata = std::fs::metadata(&path)?;
            let fingerprint = FileFingerprint::of(&metadata);

            let hash = match cache.and_then(|c| c.files.get(&relative)) {
                Some(cached) if cached.size == fingerprint.size && cached.modified == fingerprint.modified => {
                    reused += 1;
                    cached.hash.clone()
                }
                _ => hash_file(&path)?,
            };

            hashes.files.insert(
                relative.clone(),
                FileFingerprint {
                    hash: hash.clone(),
                    ..fingerprint
                },
            );
            entries.push(ManifestEntry {
                path: relative,
                size: fingerprint.size,
                hash,
            });
        }

        debug!(root = ?root, files = entries.len(), reused, "Built manifest");
        Ok((Manifest::from_entries(entries), hashes))
    }

    /// Stable identity of the manifest (BLAKE3 over its encoding)
    pub fn content_hash(&self) -> ShareResult<String> {
        let bytes = postcard::to_allocvec(self)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    /// Entries by path, for lookups inside loops
    pub fn index(&self) -> HashMap<&str, &ManifestEntry> {
        self.entries.iter().map(|e| (e.path.as_str(), e)).collect()
    }

    /// Check that totals match the entries and every path is safe to join
    /// onto a destination directory.
    pub fn validate(&self) -> ShareResult<()> {
        if self.total_files != self.entries.len() as u64 {
            return Err(ShareError::Protocol(format!(
                "manifest claims {} files but lists {}",
                self.total_files,
                self.entries.len()
            )));
        }
        let sum = total_size(&self.entries).ok_or_else(|| {
            ShareError::Protocol("manifest file sizes overflow".into())
        })?;
        if sum != self.total_bytes {
            return Err(ShareError::Protocol(format!(
                "manifest claims {} bytes but entries sum to {}",
                self.total_bytes, sum
            )));
        }
        for entry in &self.entries {
            safe_relative_path(&entry.path)?;
        }
        Ok(())
    }
}

/// Sum of entry sizes, `None` on overflow
pub fn total_size<'a>(entries: impl IntoIterator<Item = &'a ManifestEntry>) -> Option<u64> {
    entries
        .into_iter()
        .try_fold(0u64, |acc, e| acc.checked_add(e.size))
}

/// Size, mtime and hash of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub size: u64,
    /// Modification time, nanoseconds since the Unix epoch
    pub modified: i64,
    pub hash: String,
}

impl FileFingerprint {
    fn of(metadata: &std::fs::Metadata) -> Self {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            size: metadata.len(),
            modified,
            hash: String::new(),
        }
    }
}

/// Cached per-file hashes of one package root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageHashes {
    pub files: BTreeMap<String, FileFingerprint>,
}

impl PackageHashes {
    /// Hash of `path` under `root` if it matches `size`, using the cache when
    /// the file's size and mtime are unchanged. `None` when the file is absent
    /// or has a different size. Blocking.
    pub fn current_hash(&self, root: &Path, relative: &str, size: u64) -> ShareResult<Option<String>> {
        let path = root.join(safe_relative_path(relative)?);
        let metadata = match std::fs::metadata(&path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if metadata.len() != size {
            return Ok(None);
        }

        let fingerprint = FileFingerprint::of(&metadata);
        if let Some(cached) = self.files.get(relative) {
            if cached.size == fingerprint.size && cached.modified == fingerprint.modified {
                return Ok(Some(cached.hash.clone()));
            }
        }
        hash_file(&path).map(Some)
    }

    /// Record fingerprints for the files of `manifest` as they now exist
    /// under `root`. Blocking.
    pub fn record(root: &Path, manifest: &Manifest) -> ShareResult<Self> {
        let mut hashes = PackageHashes::default();
        for entry in &manifest.entries {
            let path = root.join(safe_relative_path(&entry.path)?);
            let metadata = std::fs::metadata(&path)?;
            hashes.files.insert(
                entry.path.clone(),
                FileFingerprint {
                    hash: entry.hash.clone(),
                    ..FileFingerprint::of(&metadata)
                },
            );
        }
        Ok(hashes)
    }
}

/// BLAKE3 of a file's contents, lowercase hex. Blocking.
pub fn hash_file(path: &Path) -> ShareResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Convert a manifest path into a relative filesystem path, refusing
/// anything that could escape the destination directory.
pub fn safe_relative_path(path: &str) -> ShareResult<PathBuf> {
    if path.is_empty() || path.contains('\\') || path.contains('\0') {
        return Err(ShareError::Protocol(format!("unsafe path in manifest: {:?}", path)));
    }
    let relative = PathBuf::from(path);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(ShareError::Protocol(format!(
                    "unsafe path in manifest: {:?}",
                    path
                )))
            }
        }
    }
    Ok(relative)
}

/// Item names become one directory name on the receiver.
pub fn safe_item_name(name: &str) -> ShareResult<&str> {
    let path = safe_relative_path(name)?;
    if path.components().count() != 1 || name.starts_with('.') {
        return Err(ShareError::Protocol(format!("invalid item name: {:?}", name)));
    }
    Ok(name)
}

fn to_wire_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "hi").unwrap();
        std::fs::create_dir_all(temp.path().join("data/levels")).unwrap();
        std::fs::write(temp.path().join("data/levels/1.bin"), [7u8; 100]).unwrap();
        std::fs::write(temp.path().join("b.bin"), [0u8; 1000]).unwrap();
        temp
    }

    #[test]
    fn test_build_orders_and_hashes() {
        let temp = tree();
        let (manifest, hashes) = Manifest::build(temp.path(), None).unwrap();

        let paths: Vec<&str> = manifest.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.bin", "data/levels/1.bin"]);
        assert_eq!(manifest.total_files, 3);
        assert_eq!(manifest.total_bytes, 1102);
        assert_eq!(
            manifest.get("a.txt").unwrap().hash,
            blake3::hash(b"hi").to_hex().to_string()
        );
        assert_eq!(hashes.files.len(), 3);
        manifest.validate().unwrap();
    }

    #[test]
    fn test_single_file_root() {
        let temp = tree();
        let (manifest, _) = Manifest::build(&temp.path().join("a.txt"), None).unwrap();
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].path, "a.txt");
    }

    #[test]
    fn test_cache_reused_when_unchanged() {
        let temp = tree();
        let (_, mut hashes) = Manifest::build(temp.path(), None).unwrap();

        // Poison the cache: an unchanged fingerprint must be trusted
        hashes.files.get_mut("a.txt").unwrap().hash = "cached".into();
        let (manifest, _) = Manifest::build(temp.path(), Some(&hashes)).unwrap();
        assert_eq!(manifest.get("a.txt").unwrap().hash, "cached");
    }

    #[test]
    fn test_content_hash_changes_with_content() {
        let temp = tree();
        let (first, _) = Manifest::build(temp.path(), None).unwrap();
        std::fs::write(temp.path().join("a.txt"), "ho").unwrap();
        let (second, _) = Manifest::build(temp.path(), None).unwrap();
        assert_ne!(first.content_hash().unwrap(), second.content_hash().unwrap());
    }

    #[test]
    fn test_unsafe_paths_rejected() {
        assert!(safe_relative_path("../etc/passwd").is_err());
        assert!(safe_relative_path("/etc/passwd").is_err());
        assert!(safe_relative_path("a/./b").is_ok());
        assert!(safe_relative_path("").is_err());
        assert!(safe_item_name("Game").is_ok());
        assert!(safe_item_name("a/b").is_err());
        assert!(safe_item_name(".lanshare-incoming").is_err());
    }

    #[test]
    fn test_bad_totals_rejected() {
        let mut manifest = Manifest::from_entries(vec![ManifestEntry {
            path: "a".into(),
            size: 1,
            hash: "x".into(),
        }]);
        manifest.total_bytes = 5;
        assert!(matches!(manifest.validate(), Err(ShareError::Protocol(_))));
    }

    #[test]
    fn test_overflowing_sizes_rejected() {
        let manifest = Manifest {
            entries: vec![
                ManifestEntry {
                    path: "a".into(),
                    size: u64::MAX,
                    hash: "x".into(),
                },
                ManifestEntry {
                    path: "b".into(),
                    size: 2,
                    hash: "y".into(),
                },
            ],
            total_files: 2,
            total_bytes: 1,
        };
        assert!(matches!(manifest.validate(), Err(ShareError::Protocol(_))));
        assert_eq!(total_size(&manifest.entries), None);

        // Built locally the total saturates and still fails validation
        let built = Manifest::from_entries(manifest.entries.clone());
        assert_eq!(built.total_bytes, u64::MAX);
        assert!(built.validate().is_err());
    }

    #[test]
    fn test_index_matches_get() {
        let temp = tree();
        let (manifest, _) = Manifest::build(temp.path(), None).unwrap();
        let index = manifest.index();
        assert_eq!(index.len(), 3);
        assert_eq!(index.get("b.bin").map(|e| e.size), Some(1000));
        assert_eq!(index.get("b.bin").copied(), manifest.get("b.bin"));
        assert!(index.get("missing").is_none());
    }

    #[test]
    fn test_current_hash_detects_size_change() {
        let temp = tree();
        let hashes = PackageHashes::default();
        assert!(hashes.current_hash(temp.path(), "a.txt", 2).unwrap().is_some());
        assert!(hashes.current_hash(temp.path(), "a.txt", 3).unwrap().is_none());
        assert!(hashes.current_hash(temp.path(), "missing", 3).unwrap().is_none());
    }
}
