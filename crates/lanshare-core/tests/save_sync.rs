//! Save-sync between two devices
//!
//! Both services run in-process. Offers are captured by a recording
//! publisher and handed over by the test; fetches copy straight from the
//! other device's save directory.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lanshare_core::savesync::{OfferPublisher, SaveFetcher, Side};
use lanshare_core::{
    ClockOrdering, OfferDecision, Resolution, SaveSyncEvent, SaveSyncService, ShareConfig,
    ShareError, ShareResult, Storage, SyncMode, SyncOffer,
};
use parking_lot::Mutex;
use tempfile::TempDir;

const SAVE: &str = "slot";

fn alpha_addr() -> SocketAddr {
    "10.0.0.1:47101".parse().unwrap()
}

fn beta_addr() -> SocketAddr {
    "10.0.0.2:47101".parse().unwrap()
}

// ============================================================================
// Fakes
// ============================================================================

/// Serves each peer's save directory by copying it
#[derive(Default)]
struct DirFetcher {
    sources: Mutex<HashMap<SocketAddr, PathBuf>>,
}

impl DirFetcher {
    fn register(&self, peer: SocketAddr, dir: &Path) {
        self.sources.lock().insert(peer, dir.to_path_buf());
    }
}

#[async_trait]
impl SaveFetcher for DirFetcher {
    async fn fetch(&self, peer: SocketAddr, _save_id: &str, destination: &Path) -> ShareResult<()> {
        let source = self
            .sources
            .lock()
            .get(&peer)
            .cloned()
            .ok_or_else(|| ShareError::Transport(format!("no route to {}", peer)))?;
        mirror(&source, destination);
        Ok(())
    }
}

fn mirror(source: &Path, destination: &Path) {
    if destination.exists() {
        for entry in std::fs::read_dir(destination).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                std::fs::remove_dir_all(&path).unwrap();
            } else {
                std::fs::remove_file(&path).unwrap();
            }
        }
    }
    std::fs::create_dir_all(destination).unwrap();
    for entry in walkdir::WalkDir::new(source).min_depth(1) {
        let entry = entry.unwrap();
        let target = destination.join(entry.path().strip_prefix(source).unwrap());
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target).unwrap();
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}

/// Remembers every offer instead of sending it
#[derive(Default)]
struct RecordingPublisher {
    offers: Mutex<Vec<SyncOffer>>,
}

impl RecordingPublisher {
    fn last(&self) -> SyncOffer {
        self.offers.lock().last().cloned().expect("an offer was published")
    }
}

#[async_trait]
impl OfferPublisher for RecordingPublisher {
    async fn publish(&self, offer: &SyncOffer) -> ShareResult<usize> {
        self.offers.lock().push(offer.clone());
        Ok(1)
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Device {
    _dir: TempDir,
    save_dir: PathBuf,
    published: Arc<RecordingPublisher>,
    service: SaveSyncService,
}

fn device_with(
    device_id: &str,
    fetcher: Arc<DirFetcher>,
    tweak: impl FnOnce(&mut ShareConfig),
) -> Device {
    let dir = TempDir::new().unwrap();
    let mut config = ShareConfig {
        device_id: device_id.into(),
        ..ShareConfig::with_root(dir.path())
    };
    tweak(&mut config);
    std::fs::create_dir_all(&config.data_dir).unwrap();
    let storage = Storage::new(config.database_path()).unwrap();

    let save_dir = dir.path().join("game-saves");
    std::fs::create_dir_all(&save_dir).unwrap();

    let published = Arc::new(RecordingPublisher::default());
    let publisher: Arc<dyn OfferPublisher> = published.clone();
    let service = SaveSyncService::new(&config, storage, fetcher, Some(publisher));
    Device {
        _dir: dir,
        save_dir,
        published,
        service,
    }
}

fn device(device_id: &str, fetcher: Arc<DirFetcher>) -> Device {
    device_with(device_id, fetcher, |_| {})
}

fn write_save(device: &Device, contents: &str) {
    std::fs::write(device.save_dir.join("save.dat"), contents).unwrap();
}

fn read_save(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("save.dat")).unwrap()
}

/// alpha has "level 1", beta pulled it; both at clock {alpha:1}
async fn synced_pair() -> (Arc<DirFetcher>, Device, Device) {
    let fetcher = Arc::new(DirFetcher::default());
    let alpha = device("alpha", fetcher.clone());
    let beta = device("beta", fetcher.clone());
    fetcher.register(alpha_addr(), &alpha.save_dir);
    fetcher.register(beta_addr(), &beta.save_dir);

    write_save(&alpha, "level 1");
    alpha.service.start_monitoring(SAVE, &alpha.save_dir, SyncMode::Manual).await.unwrap();
    beta.service.start_monitoring(SAVE, &beta.save_dir, SyncMode::Manual).await.unwrap();

    alpha.service.sync_now(SAVE).await.unwrap();
    let decision = beta
        .service
        .handle_offer(alpha.published.last(), alpha_addr())
        .await
        .unwrap();
    assert_eq!(decision, OfferDecision::UpdateAvailable);
    beta.service.apply_update(SAVE).await.unwrap();

    (fetcher, alpha, beta)
}

/// Diverge: alpha syncs "level 2a", beta syncs "level 2b". Returns the
/// conflict id raised on beta.
async fn diverge(alpha: &Device, beta: &Device) -> String {
    write_save(alpha, "level 2a");
    alpha.service.sync_now(SAVE).await.unwrap();
    write_save(beta, "level 2b");
    beta.service.sync_now(SAVE).await.unwrap();

    match beta
        .service
        .handle_offer(alpha.published.last(), alpha_addr())
        .await
        .unwrap()
    {
        OfferDecision::Conflict(conflict) => conflict.id,
        other => panic!("expected a conflict, got {:?}", other),
    }
}

// ============================================================================
// Updates
// ============================================================================

#[tokio::test]
async fn test_newer_offer_is_pulled_and_adopted() {
    let (_net, alpha, beta) = synced_pair().await;

    assert_eq!(read_save(&beta.save_dir), "level 1");
    let versions = beta.service.get_versions(SAVE).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].origin_device, "alpha");
    assert_eq!(versions[0].clock.get("alpha"), 1);
    assert_eq!(versions[0].clock.get("beta"), 0);

    // Same clock back the other way is nothing new
    let offer = beta.service.latest_offer(SAVE).unwrap().unwrap();
    let decision = alpha.service.handle_offer(offer, beta_addr()).await.unwrap();
    assert_eq!(decision, OfferDecision::Ignored);
}

#[tokio::test]
async fn test_older_offer_is_ignored() {
    let (_net, alpha, beta) = synced_pair().await;
    let stale = alpha.published.last();

    write_save(&beta, "level 2");
    beta.service.sync_now(SAVE).await.unwrap();

    let decision = beta.service.handle_offer(stale, alpha_addr()).await.unwrap();
    assert_eq!(decision, OfferDecision::Ignored);
    assert_eq!(read_save(&beta.save_dir), "level 2");
}

#[tokio::test]
async fn test_offer_for_unmonitored_save_is_ignored() {
    let fetcher = Arc::new(DirFetcher::default());
    let alpha = device("alpha", fetcher.clone());
    let beta = device("beta", fetcher);

    write_save(&alpha, "x");
    alpha.service.start_monitoring(SAVE, &alpha.save_dir, SyncMode::Manual).await.unwrap();
    alpha.service.sync_now(SAVE).await.unwrap();

    let decision = beta
        .service
        .handle_offer(alpha.published.last(), alpha_addr())
        .await
        .unwrap();
    assert_eq!(decision, OfferDecision::Ignored);
}

#[tokio::test]
async fn test_sync_now_without_changes_does_not_bump_clock() {
    let fetcher = Arc::new(DirFetcher::default());
    let alpha = device("alpha", fetcher);
    write_save(&alpha, "x");
    alpha.service.start_monitoring(SAVE, &alpha.save_dir, SyncMode::Manual).await.unwrap();

    let first = alpha.service.sync_now(SAVE).await.unwrap();
    let second = alpha.service.sync_now(SAVE).await.unwrap();
    assert_eq!(first.version, second.version);
    assert_eq!(second.clock.get("alpha"), 1);
    // Both calls still announce
    assert_eq!(alpha.published.offers.lock().len(), 2);
}

#[tokio::test]
async fn test_failed_fetch_keeps_update_pending() {
    let fetcher = Arc::new(DirFetcher::default());
    let alpha = device("alpha", fetcher.clone());
    let beta = device("beta", fetcher.clone());
    // alpha is never registered with the fetcher

    write_save(&alpha, "level 1");
    alpha.service.start_monitoring(SAVE, &alpha.save_dir, SyncMode::Manual).await.unwrap();
    beta.service.start_monitoring(SAVE, &beta.save_dir, SyncMode::Manual).await.unwrap();
    alpha.service.sync_now(SAVE).await.unwrap();
    beta.service
        .handle_offer(alpha.published.last(), alpha_addr())
        .await
        .unwrap();

    assert!(beta.service.apply_update(SAVE).await.is_err());

    fetcher.register(alpha_addr(), &alpha.save_dir);
    beta.service.apply_update(SAVE).await.unwrap();
    assert_eq!(read_save(&beta.save_dir), "level 1");
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn test_independent_edits_conflict() {
    let (_net, alpha, beta) = synced_pair().await;
    let id = diverge(&alpha, &beta).await;

    let pending = beta.service.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(
        pending[0].local.clock.compare(&pending[0].remote.clock),
        ClockOrdering::Concurrent
    );
    // Nothing was overwritten
    assert_eq!(read_save(&beta.save_dir), "level 2b");
}

#[tokio::test]
async fn test_unsynced_local_edit_still_conflicts() {
    let (_net, alpha, beta) = synced_pair().await;

    write_save(&alpha, "level 2a");
    alpha.service.sync_now(SAVE).await.unwrap();
    // beta edits but never calls sync_now
    write_save(&beta, "level 2b");

    let decision = beta
        .service
        .handle_offer(alpha.published.last(), alpha_addr())
        .await
        .unwrap();
    assert!(matches!(decision, OfferDecision::Conflict(_)));
    assert_eq!(read_save(&beta.save_dir), "level 2b");
}

#[tokio::test]
async fn test_keep_local_backs_up_remote_and_supersedes() {
    let (_net, alpha, beta) = synced_pair().await;
    let id = diverge(&alpha, &beta).await;
    let remote = beta.service.pending_conflicts()[0].remote.clone();

    let outcome = beta.service.resolve_conflict(&id, Resolution::KeepLocal).await.unwrap();
    assert_eq!(outcome.winner, Side::Local);
    assert_eq!(read_save(&beta.save_dir), "level 2b");
    assert_eq!(read_save(outcome.backup.as_ref().unwrap()), "level 2a");
    assert!(beta.service.pending_conflicts().is_empty());

    // The new version dominates the remote side
    assert_eq!(outcome.version.clock.compare(&remote.clock), ClockOrdering::After);

    // alpha now sees a strictly newer version
    let decision = alpha
        .service
        .handle_offer(beta.published.last(), beta_addr())
        .await
        .unwrap();
    assert_eq!(decision, OfferDecision::UpdateAvailable);
}

#[tokio::test]
async fn test_use_remote_backs_up_local() {
    let (_net, alpha, beta) = synced_pair().await;
    let id = diverge(&alpha, &beta).await;

    let outcome = beta.service.resolve_conflict(&id, Resolution::UseRemote).await.unwrap();
    assert_eq!(outcome.winner, Side::Remote);
    assert_eq!(read_save(&beta.save_dir), "level 2a");
    assert_eq!(read_save(outcome.backup.as_ref().unwrap()), "level 2b");
    assert_eq!(outcome.version.clock.get("alpha"), 2);
    assert_eq!(outcome.version.clock.get("beta"), 1);

    // Same content on alpha: clocks merge, nothing to pull
    let offer = beta.service.latest_offer(SAVE).unwrap().unwrap();
    let decision = alpha.service.handle_offer(offer, beta_addr()).await.unwrap();
    assert_eq!(decision, OfferDecision::Ignored);
}

#[tokio::test]
async fn test_keep_both_stores_remote_copy() {
    let (_net, alpha, beta) = synced_pair().await;
    let id = diverge(&alpha, &beta).await;

    let outcome = beta.service.resolve_conflict(&id, Resolution::KeepBoth).await.unwrap();
    assert_eq!(outcome.winner, Side::Local);
    assert_eq!(read_save(&beta.save_dir), "level 2b");
    assert_eq!(read_save(outcome.backup.as_ref().unwrap()), "level 2a");
}

#[tokio::test]
async fn test_last_writer_wins_uses_logical_time() {
    let (_net, alpha, beta) = synced_pair().await;

    // alpha advances twice: {alpha:3}, beta once: {alpha:1, beta:1}
    write_save(&alpha, "level 2a");
    alpha.service.sync_now(SAVE).await.unwrap();
    write_save(&alpha, "level 3a");
    alpha.service.sync_now(SAVE).await.unwrap();
    write_save(&beta, "level 2b");
    beta.service.sync_now(SAVE).await.unwrap();

    let OfferDecision::Conflict(conflict) = beta
        .service
        .handle_offer(alpha.published.last(), alpha_addr())
        .await
        .unwrap()
    else {
        panic!("expected a conflict");
    };

    let outcome = beta
        .service
        .resolve_conflict(&conflict.id, Resolution::LastWriterWins)
        .await
        .unwrap();
    assert_eq!(outcome.winner, Side::Remote);
    assert!(!outcome.unreliable);
    assert_eq!(read_save(&beta.save_dir), "level 3a");
    assert_eq!(read_save(outcome.backup.as_ref().unwrap()), "level 2b");
}

#[tokio::test]
async fn test_last_writer_wins_tie_is_flagged() {
    let (_net, alpha, beta) = synced_pair().await;
    // {alpha:2} against {alpha:1, beta:1}: both sum to 2
    let id = diverge(&alpha, &beta).await;

    let outcome = beta
        .service
        .resolve_conflict(&id, Resolution::LastWriterWins)
        .await
        .unwrap();
    assert!(outcome.unreliable);
    assert!(outcome.backup.is_some());
}

#[tokio::test]
async fn test_failed_resolution_keeps_conflict() {
    let (net, alpha, beta) = synced_pair().await;
    let id = diverge(&alpha, &beta).await;

    net.sources.lock().clear();
    assert!(beta.service.resolve_conflict(&id, Resolution::UseRemote).await.is_err());
    assert_eq!(beta.service.pending_conflicts().len(), 1);
    assert_eq!(read_save(&beta.save_dir), "level 2b");

    assert!(matches!(
        beta.service.resolve_conflict("no-such-conflict", Resolution::KeepLocal).await,
        Err(ShareError::NotFound(_))
    ));
}

// ============================================================================
// Versions
// ============================================================================

#[tokio::test]
async fn test_versions_are_bounded_and_restorable() {
    let fetcher = Arc::new(DirFetcher::default());
    let alpha = device_with("alpha", fetcher, |c| c.max_save_versions = 3);
    alpha.service.start_monitoring(SAVE, &alpha.save_dir, SyncMode::Manual).await.unwrap();

    for n in 1..=5 {
        write_save(&alpha, &format!("checkpoint {}", n));
        alpha.service.sync_now(SAVE).await.unwrap();
    }

    let numbers: Vec<u64> = alpha
        .service
        .get_versions(SAVE)
        .unwrap()
        .iter()
        .map(|v| v.version)
        .collect();
    assert_eq!(numbers, vec![3, 4, 5]);

    let restored = alpha.service.restore_version(SAVE, 3).await.unwrap();
    assert_eq!(read_save(&alpha.save_dir), "checkpoint 3");
    assert_eq!(restored.version, 6);
    assert_eq!(restored.clock.get("alpha"), 6);
    assert_eq!(alpha.published.last().version, 6);

    assert!(matches!(
        alpha.service.restore_version(SAVE, 1).await,
        Err(ShareError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_empty_directory_has_no_baseline() {
    let fetcher = Arc::new(DirFetcher::default());
    let alpha = device("alpha", fetcher);
    let state = alpha
        .service
        .start_monitoring(SAVE, &alpha.save_dir, SyncMode::Manual)
        .await
        .unwrap();
    assert!(state.clock.is_empty());
    assert!(alpha.service.get_versions(SAVE).unwrap().is_empty());
    assert!(alpha.service.latest_offer(SAVE).unwrap().is_none());

    // An explicit sync still versions the empty directory
    let version = alpha.service.sync_now(SAVE).await.unwrap();
    assert_eq!(version.file_count, 0);
    assert_eq!(version.clock.get("alpha"), 1);
}

#[tokio::test]
async fn test_monitoring_rejects_missing_directory() {
    let fetcher = Arc::new(DirFetcher::default());
    let alpha = device("alpha", fetcher);
    let missing = alpha.save_dir.join("nope");
    assert!(alpha
        .service
        .start_monitoring(SAVE, &missing, SyncMode::Manual)
        .await
        .is_err());
    assert!(alpha.service.monitored().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_automatic_mode_syncs_after_quiet_period() {
    let fetcher = Arc::new(DirFetcher::default());
    let alpha = device_with("alpha", fetcher, |c| c.save_debounce = Duration::from_millis(200));
    write_save(&alpha, "start");
    alpha
        .service
        .start_monitoring(SAVE, &alpha.save_dir, SyncMode::Automatic)
        .await
        .unwrap();
    let mut events = alpha.service.subscribe();

    // Let the watcher settle before editing
    tokio::time::sleep(Duration::from_millis(100)).await;
    write_save(&alpha, "edited");

    let version = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(SaveSyncEvent::VersionCreated(v)) = events.recv().await {
                break v;
            }
        }
    })
    .await
    .expect("automatic sync fired");
    assert_eq!(version.version, 2);
    assert!(alpha.service.stop_monitoring(SAVE));
    assert!(!alpha.service.stop_monitoring(SAVE));
}
