//! Save-sync service
//!
//! Versioned backups, vector-clock comparison of remote offers and conflict
//! surfacing for monitored save directories. Remote data is pulled through a
//! [`SaveFetcher`]; offers go out through an [`OfferPublisher`]. Both are
//! injected so the service can be driven by fakes in tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::types::{
    Conflict, OfferDecision, Resolution, ResolutionOutcome, SaveState, SaveSyncEvent, SaveVersion,
    Side, SyncOffer,
};
use super::versions::{Snapshot, VersionStore};
use super::watcher::SaveWatcher;
use crate::clock::ClockOrdering;
use crate::config::ShareConfig;
use crate::discovery::DiscoveryService;
use crate::error::{ShareError, ShareResult};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::storage::Storage;
use crate::transfer::manifest::safe_item_name;
use crate::transfer::{SaveProvider, TransferService};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pulls the current contents of a remote save into a local directory
#[async_trait]
pub trait SaveFetcher: Send + Sync {
    async fn fetch(&self, peer: SocketAddr, save_id: &str, destination: &Path) -> ShareResult<()>;
}

/// Announces a new version to peers. Returns how many were addressed.
#[async_trait]
pub trait OfferPublisher: Send + Sync {
    async fn publish(&self, offer: &SyncOffer) -> ShareResult<usize>;
}

/// Fetches saves with the transfer protocol's `SaveRequest`
#[derive(Debug, Clone)]
pub struct TransferSaveFetcher {
    transfer: TransferService,
}

impl TransferSaveFetcher {
    pub fn new(transfer: TransferService) -> Self {
        Self { transfer }
    }
}

#[async_trait]
impl SaveFetcher for TransferSaveFetcher {
    async fn fetch(&self, peer: SocketAddr, save_id: &str, destination: &Path) -> ShareResult<()> {
        let result = self.transfer.request_save(peer, save_id, destination).await;
        if result.success {
            Ok(())
        } else {
            Err(ShareError::Transport(
                result.error.unwrap_or_else(|| "save fetch failed".into()),
            ))
        }
    }
}

#[async_trait]
impl OfferPublisher for DiscoveryService {
    async fn publish(&self, offer: &SyncOffer) -> ShareResult<usize> {
        self.send_save_offer(offer.to_payload()?).await
    }
}

/// Whether filesystem changes trigger `sync_now` by themselves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Manual,
    Automatic,
}

struct Monitored {
    path: PathBuf,
    _watcher: Option<SaveWatcher>,
}

struct Inner {
    device_id: String,
    debounce: Duration,
    storage: Storage,
    versions: VersionStore,
    fetcher: Arc<dyn SaveFetcher>,
    publisher: Option<Arc<dyn OfferPublisher>>,
    monitored: RwLock<HashMap<String, Monitored>>,
    conflicts: RwLock<HashMap<String, Conflict>>,
    updates: RwLock<HashMap<String, (SyncOffer, SocketAddr)>>,
    locks: KeyedLocks<String>,
    event_tx: broadcast::Sender<SaveSyncEvent>,
    trigger_tx: mpsc::UnboundedSender<String>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    trigger_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.trigger_task.lock().take() {
            task.abort();
        }
    }
}

/// Save-sync service handle. Cheap to clone.
#[derive(Clone)]
pub struct SaveSyncService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SaveSyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveSyncService")
            .field("device_id", &self.inner.device_id)
            .field("monitored", &self.inner.monitored.read().len())
            .field("conflicts", &self.inner.conflicts.read().len())
            .finish()
    }
}

/// Serves monitored save directories to `SaveRequest`s
struct MonitoredSaves(Weak<Inner>);

impl SaveProvider for MonitoredSaves {
    fn save_dir(&self, save_id: &str) -> Option<PathBuf> {
        let inner = self.0.upgrade()?;
        let monitored = inner.monitored.read();
        monitored.get(save_id).map(|m| m.path.clone())
    }
}

impl SaveSyncService {
    pub fn new(
        config: &ShareConfig,
        storage: Storage,
        fetcher: Arc<dyn SaveFetcher>,
        publisher: Option<Arc<dyn OfferPublisher>>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let versions = VersionStore::new(
            config.data_dir.join("saves"),
            storage.clone(),
            config.max_save_versions,
        );

        Self {
            inner: Arc::new(Inner {
                device_id: config.device_id.clone(),
                debounce: config.save_debounce,
                storage,
                versions,
                fetcher,
                publisher,
                monitored: RwLock::new(HashMap::new()),
                conflicts: RwLock::new(HashMap::new()),
                updates: RwLock::new(HashMap::new()),
                locks: KeyedLocks::new(),
                event_tx,
                trigger_tx,
                trigger_rx: Mutex::new(Some(trigger_rx)),
                trigger_task: Mutex::new(None),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveSyncEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Provider for [`TransferService::set_save_provider`]
    pub fn save_provider(&self) -> Arc<dyn SaveProvider> {
        Arc::new(MonitoredSaves(Arc::downgrade(&self.inner)))
    }

    /// Start watching `path` as save `save_id`. A non-empty directory seen
    /// for the first time becomes the baseline version.
    pub async fn start_monitoring(
        &self,
        save_id: &str,
        path: &Path,
        mode: SyncMode,
    ) -> ShareResult<SaveState> {
        safe_item_name(save_id)?;
        if !path.is_dir() {
            return Err(ShareError::NotFound(format!(
                "save directory {}",
                path.display()
            )));
        }

        let _guard = self.lock(save_id).await?;
        let mut state = self
            .inner
            .storage
            .load_save_state(save_id)?
            .unwrap_or_else(|| SaveState::new(save_id, path.to_path_buf()));
        if state.path != path {
            info!(save_id, old = ?state.path, new = ?path, "Save directory moved");
            state.path = path.to_path_buf();
        }
        self.inner.storage.save_save_state(&state)?;

        let baseline = self.record_local(&mut state, true).await?;
        if let Some(version) = &baseline {
            debug!(save_id, version = version.version, "Recorded baseline version");
        }

        let watcher = match mode {
            SyncMode::Automatic => {
                self.ensure_trigger_loop();
                Some(SaveWatcher::start(
                    save_id,
                    path,
                    self.inner.debounce,
                    self.inner.trigger_tx.clone(),
                )?)
            }
            SyncMode::Manual => None,
        };
        self.inner.monitored.write().insert(
            save_id.to_string(),
            Monitored {
                path: path.to_path_buf(),
                _watcher: watcher,
            },
        );
        info!(save_id, path = ?path, ?mode, clock = %state.clock, "Monitoring save");
        Ok(state)
    }

    /// Stop watching. Versions and clock stay persisted.
    pub fn stop_monitoring(&self, save_id: &str) -> bool {
        let removed = self.inner.monitored.write().remove(save_id).is_some();
        if removed {
            info!(save_id, "Stopped monitoring save");
        }
        removed
    }

    pub fn monitored(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.monitored.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot the directory, version it when it changed (advancing our
    /// clock entry) and offer the latest version to peers.
    pub async fn sync_now(&self, save_id: &str) -> ShareResult<SaveVersion> {
        let _guard = self.lock(save_id).await?;
        let mut state = self.state(save_id)?;
        let version = match self.record_local(&mut state, false).await? {
            Some(version) => version,
            None => self
                .inner
                .versions
                .latest(save_id)?
                .ok_or_else(|| ShareError::NotFound(format!("versions of {}", save_id)))?,
        };
        self.announce(&version).await;
        Ok(version)
    }

    /// Latest version as an offer, if any
    pub fn latest_offer(&self, save_id: &str) -> ShareResult<Option<SyncOffer>> {
        Ok(self
            .inner
            .versions
            .latest(save_id)?
            .map(|v| SyncOffer::from_version(&v)))
    }

    /// Compare a remote offer against local state.
    pub async fn handle_offer(&self, offer: SyncOffer, peer: SocketAddr) -> ShareResult<OfferDecision> {
        let save_id = offer.save_id.clone();
        let monitored = self.inner.monitored.read().contains_key(&save_id);
        if !monitored {
            debug!(%save_id, %peer, "Offer for a save we do not monitor");
            return Ok(OfferDecision::Ignored);
        }

        let _guard = self.lock(&save_id).await?;
        let mut state = self.state(&save_id)?;
        // Unversioned local edits must take part in the comparison
        self.record_local(&mut state, true).await?;

        let ordering = state.clock.compare(&offer.clock);
        let same_content = state.last_hash.as_deref() == Some(offer.content_hash.as_str());
        debug!(%save_id, %peer, ?ordering, same_content, local = %state.clock, remote = %offer.clock, "Compared offer");

        match ordering {
            ClockOrdering::Equal | ClockOrdering::After => Ok(OfferDecision::Ignored),
            _ if same_content => {
                state.clock.merge(&offer.clock);
                self.inner.storage.save_save_state(&state)?;
                Ok(OfferDecision::Ignored)
            }
            ClockOrdering::Before => {
                info!(%save_id, %peer, version = offer.version, "Newer save available");
                self.inner
                    .updates
                    .write()
                    .insert(save_id.clone(), (offer.clone(), peer));
                self.emit(SaveSyncEvent::UpdateAvailable { offer, peer });
                Ok(OfferDecision::UpdateAvailable)
            }
            ClockOrdering::Concurrent => {
                let local = match self.inner.versions.latest(&save_id)? {
                    Some(v) => v,
                    None => SaveVersion {
                        save_id: save_id.clone(),
                        version: 0,
                        content_hash: state.last_hash.clone().unwrap_or_default(),
                        size: 0,
                        file_count: 0,
                        clock: state.clock.clone(),
                        origin_device: self.inner.device_id.clone(),
                        created_at: Utc::now(),
                    },
                };
                let conflict = Conflict {
                    id: ulid::Ulid::new().to_string(),
                    save_id: save_id.clone(),
                    local,
                    remote: offer,
                    peer,
                    detected_at: Utc::now(),
                };
                warn!(%save_id, %peer, conflict = %conflict.id, "Concurrent save changes");
                self.inner
                    .conflicts
                    .write()
                    .insert(conflict.id.clone(), conflict.clone());
                self.emit(SaveSyncEvent::ConflictDetected(conflict.clone()));
                Ok(OfferDecision::Conflict(conflict))
            }
        }
    }

    /// Pull the pending newer version of `save_id` into place.
    pub async fn apply_update(&self, save_id: &str) -> ShareResult<SaveVersion> {
        let Some((offer, peer)) = self.inner.updates.write().remove(save_id) else {
            return Err(ShareError::NotFound(format!("pending update for {}", save_id)));
        };

        let _guard = self.lock(save_id).await?;
        let mut state = self.state(save_id)?;
        let result = async {
            self.inner.fetcher.fetch(peer, save_id, &state.path).await?;
            self.adopt_remote(&mut state, &offer).await
        }
        .await;

        match result {
            Ok(version) => {
                self.emit(SaveSyncEvent::UpdateApplied(version.clone()));
                Ok(version)
            }
            Err(e) => {
                self.inner
                    .updates
                    .write()
                    .entry(save_id.to_string())
                    .or_insert((offer, peer));
                self.emit(SaveSyncEvent::SyncFailed {
                    save_id: save_id.to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub fn pending_conflicts(&self) -> Vec<Conflict> {
        let mut list: Vec<Conflict> = self.inner.conflicts.read().values().cloned().collect();
        list.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        list
    }

    /// Settle a conflict. Any side that gets discarded is backed up first.
    /// On failure the conflict stays pending.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
    ) -> ShareResult<ResolutionOutcome> {
        let Some(conflict) = self.inner.conflicts.write().remove(conflict_id) else {
            return Err(ShareError::NotFound(format!("conflict {}", conflict_id)));
        };

        let result = self.settle(&conflict, resolution).await;
        match result {
            Ok(outcome) => {
                info!(
                    save_id = %conflict.save_id,
                    conflict = conflict_id,
                    %resolution,
                    winner = ?outcome.winner,
                    unreliable = outcome.unreliable,
                    "Conflict resolved"
                );
                self.emit(SaveSyncEvent::ConflictResolved(outcome.clone()));
                Ok(outcome)
            }
            Err(e) => {
                warn!(conflict = conflict_id, error = %e, "Conflict resolution failed");
                self.inner
                    .conflicts
                    .write()
                    .insert(conflict.id.clone(), conflict);
                Err(e)
            }
        }
    }

    pub fn get_versions(&self, save_id: &str) -> ShareResult<Vec<SaveVersion>> {
        self.inner.versions.list(save_id)
    }

    /// Put a stored version back in place. The restore is a local change:
    /// it becomes a new version and is offered to peers.
    pub async fn restore_version(&self, save_id: &str, version: u64) -> ShareResult<SaveVersion> {
        let _guard = self.lock(save_id).await?;
        let mut state = self.state(save_id)?;
        if self.inner.versions.get(save_id, version)?.is_none() {
            return Err(ShareError::NotFound(format!("{} version {}", save_id, version)));
        }

        // Keep whatever is there now before overwriting it
        self.record_local(&mut state, true).await?;

        let store = self.inner.versions.clone();
        let id = save_id.to_string();
        let target = state.path.clone();
        crate::transfer::run_blocking(move || store.restore(&id, version, &target)).await?;
        info!(save_id, version, "Restored save version");
        self.emit(SaveSyncEvent::Restored {
            save_id: save_id.to_string(),
            version,
        });

        let current = match self.record_local(&mut state, false).await? {
            Some(v) => v,
            None => self
                .inner
                .versions
                .latest(save_id)?
                .ok_or_else(|| ShareError::NotFound(format!("versions of {}", save_id)))?,
        };
        self.announce(&current).await;
        Ok(current)
    }

    async fn settle(&self, conflict: &Conflict, resolution: Resolution) -> ShareResult<ResolutionOutcome> {
        let save_id = conflict.save_id.as_str();
        let _guard = self.lock(save_id).await?;
        let mut state = self.state(save_id)?;

        let (winner, unreliable) = match resolution {
            Resolution::KeepLocal | Resolution::KeepBoth => (Side::Local, false),
            Resolution::UseRemote => (Side::Remote, false),
            Resolution::LastWriterWins => last_writer(&conflict.local, &conflict.remote),
        };

        let (backup, version) = match (resolution, winner) {
            (Resolution::KeepBoth, _) => {
                let copy = self.inner.versions.remote_copy_dir(save_id)?;
                self.inner.fetcher.fetch(conflict.peer, save_id, &copy).await?;
                let version = self.supersede(&mut state, conflict).await?;
                (Some(copy), version)
            }
            (_, Side::Local) => {
                let discarded = self.inner.versions.discarded_dir(save_id, "remote")?;
                self.inner.fetcher.fetch(conflict.peer, save_id, &discarded).await?;
                let version = self.supersede(&mut state, conflict).await?;
                (Some(discarded), version)
            }
            (_, Side::Remote) => {
                let store = self.inner.versions.clone();
                let id = save_id.to_string();
                let source = state.path.clone();
                let backup =
                    crate::transfer::run_blocking(move || store.backup(&id, &source, "local")).await?;
                self.inner.fetcher.fetch(conflict.peer, save_id, &state.path).await?;
                let version = self.adopt_remote(&mut state, &conflict.remote).await?;
                (Some(backup), version)
            }
        };

        Ok(ResolutionOutcome {
            conflict_id: conflict.id.clone(),
            resolution,
            winner,
            unreliable,
            backup,
            version,
        })
    }

    /// Local contents win: new version whose clock dominates both sides.
    async fn supersede(&self, state: &mut SaveState, conflict: &Conflict) -> ShareResult<SaveVersion> {
        state.clock.merge(&conflict.remote.clock);
        state.clock.increment(&self.inner.device_id);
        let path = state.path.clone();
        let snapshot = crate::transfer::run_blocking(move || Snapshot::of(&path)).await?;
        let version = self.commit(state, snapshot, self.inner.device_id.clone()).await?;
        self.announce(&version).await;
        Ok(version)
    }

    /// Remote contents are now in place: version them under the merged clock.
    async fn adopt_remote(&self, state: &mut SaveState, offer: &SyncOffer) -> ShareResult<SaveVersion> {
        let path = state.path.clone();
        let snapshot = crate::transfer::run_blocking(move || Snapshot::of(&path)).await?;
        if snapshot.content_hash != offer.content_hash {
            warn!(
                save_id = %offer.save_id,
                expected = %offer.content_hash,
                actual = %snapshot.content_hash,
                "Fetched save differs from the offer"
            );
        }
        state.clock.merge(&offer.clock);
        self.commit(state, snapshot, offer.origin_device.clone()).await
    }

    /// Version the directory if its content changed since the last version.
    /// With `skip_empty_baseline`, an empty never-versioned directory is
    /// left without a version.
    async fn record_local(
        &self,
        state: &mut SaveState,
        skip_empty_baseline: bool,
    ) -> ShareResult<Option<SaveVersion>> {
        let path = state.path.clone();
        let snapshot = crate::transfer::run_blocking(move || Snapshot::of(&path)).await?;
        if state.last_hash.as_deref() == Some(snapshot.content_hash.as_str()) {
            return Ok(None);
        }
        if skip_empty_baseline && state.last_hash.is_none() && snapshot.file_count == 0 {
            return Ok(None);
        }
        state.clock.increment(&self.inner.device_id);
        let version = self.commit(state, snapshot, self.inner.device_id.clone()).await?;
        Ok(Some(version))
    }

    async fn commit(
        &self,
        state: &mut SaveState,
        snapshot: Snapshot,
        origin_device: String,
    ) -> ShareResult<SaveVersion> {
        let version = SaveVersion {
            save_id: state.save_id.clone(),
            version: state.next_version,
            content_hash: snapshot.content_hash.clone(),
            size: snapshot.size,
            file_count: snapshot.file_count,
            clock: state.clock.clone(),
            origin_device,
            created_at: Utc::now(),
        };

        let store = self.inner.versions.clone();
        let source = state.path.clone();
        let stored = version.clone();
        crate::transfer::run_blocking(move || store.store(&source, &stored)).await?;

        state.next_version += 1;
        state.last_hash = Some(snapshot.content_hash);
        self.inner.storage.save_save_state(state)?;

        info!(
            save_id = %version.save_id,
            version = version.version,
            files = version.file_count,
            clock = %version.clock,
            "Created save version"
        );
        self.emit(SaveSyncEvent::VersionCreated(version.clone()));
        Ok(version)
    }

    async fn announce(&self, version: &SaveVersion) {
        let Some(publisher) = &self.inner.publisher else {
            return;
        };
        let offer = SyncOffer::from_version(version);
        match publisher.publish(&offer).await {
            Ok(peers) => self.emit(SaveSyncEvent::OfferSent {
                save_id: version.save_id.clone(),
                peers,
            }),
            Err(e) => warn!(save_id = %version.save_id, error = %e, "Could not offer save version"),
        }
    }

    fn state(&self, save_id: &str) -> ShareResult<SaveState> {
        self.inner
            .storage
            .load_save_state(save_id)?
            .ok_or_else(|| ShareError::NotFound(format!("save {} is not monitored", save_id)))
    }

    async fn lock(&self, save_id: &str) -> ShareResult<KeyedGuard<String>> {
        Ok(self.inner.locks.lock(save_id.to_string()).await)
    }

    fn emit(&self, event: SaveSyncEvent) {
        let _ = self.inner.event_tx.send(event);
    }

    /// Run `sync_now` for saves whose watcher went quiet.
    fn ensure_trigger_loop(&self) {
        let Some(mut rx) = self.inner.trigger_rx.lock().take() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            while let Some(save_id) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = SaveSyncService { inner };
                let monitored = service.inner.monitored.read().contains_key(&save_id);
                if !monitored {
                    continue;
                }
                if let Err(e) = service.sync_now(&save_id).await {
                    warn!(%save_id, error = %e, "Automatic sync failed");
                    service.emit(SaveSyncEvent::SyncFailed {
                        save_id: save_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        });
        *self.inner.trigger_task.lock() = Some(task);
    }
}

/// Larger summed logical time wins; an exact tie falls back to wall-clock
/// creation time and is flagged unreliable. A full tie keeps local.
pub fn last_writer(local: &SaveVersion, remote: &SyncOffer) -> (Side, bool) {
    let ours = local.clock.logical_sum();
    let theirs = remote.clock.logical_sum();
    if ours > theirs {
        (Side::Local, false)
    } else if theirs > ours {
        (Side::Remote, false)
    } else if remote.created_at > local.created_at {
        (Side::Remote, true)
    } else {
        (Side::Local, true)
    }
}
