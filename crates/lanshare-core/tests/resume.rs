//! Resuming interrupted receives
//!
//! An interruption is reproduced by seeding the receiver with the resume
//! record and staged files an earlier attempt would have left behind.

use std::path::{Path, PathBuf};

use lanshare_core::config::BindPolicy;
use lanshare_core::transfer::{Manifest, TransferState, STAGING_DIR};
use lanshare_core::{ShareConfig, Storage, TransferService};
use tempfile::TempDir;

struct Receiver {
    _dir: TempDir,
    config: ShareConfig,
    storage: Storage,
    service: TransferService,
}

fn receiver() -> Receiver {
    let dir = TempDir::new().unwrap();
    let config = ShareConfig {
        device_id: "receiver".into(),
        transfer_port: 0,
        bind: BindPolicy::Loopback,
        auto_accept: true,
        ..ShareConfig::with_root(dir.path())
    };
    std::fs::create_dir_all(&config.data_dir).unwrap();
    let storage = Storage::new(config.database_path()).unwrap();
    let service = TransferService::new(&config, storage.clone()).unwrap();
    Receiver {
        _dir: dir,
        config,
        storage,
        service,
    }
}

fn sender(root: &Path) -> TransferService {
    let config = ShareConfig {
        device_id: "sender".into(),
        transfer_port: 0,
        bind: BindPolicy::Loopback,
        ..ShareConfig::with_root(root)
    };
    std::fs::create_dir_all(&config.data_dir).unwrap();
    let storage = Storage::new(config.database_path()).unwrap();
    TransferService::new(&config, storage).unwrap()
}

/// Four files of distinct sizes under `<root>/save-pack`
fn package(root: &Path) -> PathBuf {
    let pack = root.join("save-pack");
    std::fs::create_dir_all(pack.join("sub")).unwrap();
    std::fs::write(pack.join("one.bin"), vec![1u8; 100]).unwrap();
    std::fs::write(pack.join("two.bin"), vec![2u8; 200_000]).unwrap();
    std::fs::write(pack.join("sub/three.bin"), vec![3u8; 3000]).unwrap();
    std::fs::write(pack.join("sub/four.bin"), vec![4u8; 40]).unwrap();
    pack
}

fn staging_dir(receiver: &Receiver, item: &str) -> PathBuf {
    receiver.config.receive_dir.join(STAGING_DIR).join(item)
}

fn state_key(receiver: &Receiver, item: &str) -> String {
    receiver
        .config
        .receive_dir
        .join(item)
        .to_string_lossy()
        .into_owned()
}

/// Stage `done` as an earlier attempt would have and record them.
fn seed_interrupted(receiver: &Receiver, pack: &Path, manifest: &Manifest, hash: &str, done: &[&str]) {
    let staging = staging_dir(receiver, "save-pack");
    let mut state = TransferState::new("earlier", "save-pack", manifest, hash);
    for path in done {
        let target = staging.join(path);
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::copy(pack.join(path), &target).unwrap();
        let size = manifest.get(path).unwrap().size;
        state.mark_completed(path, size);
    }
    receiver
        .storage
        .save_transfer_state(&state_key(receiver, "save-pack"), &state)
        .unwrap();
}

fn assert_tree_matches(pack: &Path, landed: &Path, manifest: &Manifest) {
    for entry in &manifest.entries {
        assert_eq!(
            std::fs::read(pack.join(&entry.path)).unwrap(),
            std::fs::read(landed.join(&entry.path)).unwrap(),
            "{} differs",
            entry.path
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_receives_only_missing_files() {
    let source_dir = TempDir::new().unwrap();
    let pack = package(source_dir.path());
    let (manifest, _) = Manifest::build(&pack, None).unwrap();
    let hash = manifest.content_hash().unwrap();

    let receiver = receiver();
    seed_interrupted(&receiver, &pack, &manifest, &hash, &["one.bin", "sub/four.bin"]);

    #[cfg(unix)]
    let staged_inodes: Vec<u64> = {
        use std::os::unix::fs::MetadataExt;
        ["one.bin", "sub/four.bin"]
            .iter()
            .map(|p| std::fs::metadata(staging_dir(&receiver, "save-pack").join(p)).unwrap().ino())
            .collect()
    };

    let addr = receiver.service.start().await.unwrap();
    let result = sender(source_dir.path()).send_package(addr, &pack).await;
    assert!(result.success, "{:?}", result.error);

    // Exactly N - K files crossed the wire
    assert_eq!(result.stats.files_transferred, 2);
    let mut skipped = result.skipped_files.clone();
    skipped.sort();
    assert_eq!(skipped, vec!["one.bin".to_string(), "sub/four.bin".to_string()]);

    let landed = receiver.config.receive_dir.join("save-pack");
    assert_tree_matches(&pack, &landed, &manifest);

    // The K staged files were moved into place, never rewritten
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let landed_inodes: Vec<u64> = ["one.bin", "sub/four.bin"]
            .iter()
            .map(|p| std::fs::metadata(landed.join(p)).unwrap().ino())
            .collect();
        assert_eq!(staged_inodes, landed_inodes);
    }

    assert!(receiver
        .storage
        .load_transfer_state(&state_key(&receiver, "save-pack"))
        .unwrap()
        .is_none());

    receiver.service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changed_manifest_discards_resume_state() {
    let source_dir = TempDir::new().unwrap();
    let pack = package(source_dir.path());
    let (manifest, _) = Manifest::build(&pack, None).unwrap();

    let receiver = receiver();
    seed_interrupted(&receiver, &pack, &manifest, "hash-of-an-older-package", &["one.bin", "two.bin"]);

    let addr = receiver.service.start().await.unwrap();
    let result = sender(source_dir.path()).send_package(addr, &pack).await;
    assert!(result.success, "{:?}", result.error);

    // All N received fresh
    assert_eq!(result.stats.files_transferred, 4);
    assert!(result.skipped_files.is_empty());
    assert_tree_matches(&pack, &receiver.config.receive_dir.join("save-pack"), &manifest);

    receiver.service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recorded_file_missing_from_staging_is_received_again() {
    let source_dir = TempDir::new().unwrap();
    let pack = package(source_dir.path());
    let (manifest, _) = Manifest::build(&pack, None).unwrap();
    let hash = manifest.content_hash().unwrap();

    let receiver = receiver();
    seed_interrupted(&receiver, &pack, &manifest, &hash, &["one.bin", "two.bin"]);
    std::fs::remove_file(staging_dir(&receiver, "save-pack").join("two.bin")).unwrap();

    let addr = receiver.service.start().await.unwrap();
    let result = sender(source_dir.path()).send_package(addr, &pack).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.skipped_files, vec!["one.bin".to_string()]);
    assert_eq!(result.stats.files_transferred, 3);
    assert_tree_matches(&pack, &receiver.config.receive_dir.join("save-pack"), &manifest);

    receiver.service.stop().await;
}

#[test]
fn test_orphaned_records_pruned_after_grace_period() {
    let dir = TempDir::new().unwrap();
    let storage = Storage::new(dir.path().join("lanshare.redb")).unwrap();
    let manifest = Manifest::default();

    let fresh = TransferState::new("fresh", "a", &manifest, "h");
    let mut stale = TransferState::new("stale", "b", &manifest, "h");
    stale.updated_at = chrono::Utc::now() - chrono::Duration::hours(30);

    storage.save_transfer_state("/recv/a", &fresh).unwrap();
    storage.save_transfer_state("/recv/b", &stale).unwrap();

    let pruned = storage
        .prune_stale_transfer_states(chrono::Duration::hours(24))
        .unwrap();
    assert_eq!(pruned, vec!["/recv/b".to_string()]);
    assert!(storage.load_transfer_state("/recv/a").unwrap().is_some());
    assert!(storage.load_transfer_state("/recv/b").unwrap().is_none());
}
