//! Library catalog: one item per top-level entry of the library directory

use std::path::Path;

use tracing::warn;
use walkdir::WalkDir;

use super::protocol::{LibraryCatalog, LibraryItem};
use crate::error::ShareResult;

/// Summarize the packages under `library_dir`. A missing directory is an
/// empty library; hidden entries are skipped. Blocking.
pub fn scan(library_dir: &Path) -> ShareResult<LibraryCatalog> {
    let read = match std::fs::read_dir(library_dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LibraryCatalog::default()),
        Err(e) => return Err(e.into()),
    };

    let mut items = Vec::new();
    for entry in read {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        let mut size = 0u64;
        let mut file_count = 0u64;
        for file in WalkDir::new(entry.path()) {
            let file = match file {
                Ok(f) => f,
                Err(e) => {
                    warn!(item = %name, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if file.file_type().is_file() {
                file_count += 1;
                size += file.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        items.push(LibraryItem {
            name,
            size,
            file_count,
        });
    }
    items.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(LibraryCatalog { items })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_library() {
        let temp = TempDir::new().unwrap();
        let game = temp.path().join("Game");
        std::fs::create_dir_all(game.join("data")).unwrap();
        std::fs::write(game.join("run.exe"), vec![0u8; 10]).unwrap();
        std::fs::write(game.join("data/level.pak"), vec![0u8; 5]).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "abc").unwrap();
        std::fs::create_dir(temp.path().join(".hidden")).unwrap();

        let catalog = scan(temp.path()).unwrap();
        assert_eq!(
            catalog.items,
            vec![
                LibraryItem {
                    name: "Game".into(),
                    size: 15,
                    file_count: 2
                },
                LibraryItem {
                    name: "notes.txt".into(),
                    size: 3,
                    file_count: 1
                },
            ]
        );
    }

    #[test]
    fn test_missing_library_is_empty() {
        let temp = TempDir::new().unwrap();
        let catalog = scan(&temp.path().join("nope")).unwrap();
        assert!(catalog.items.is_empty());
    }
}
