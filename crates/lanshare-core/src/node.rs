//! LanShareNode - the primary entry point for a lanshare device
//!
//! LanShareNode wires Storage, DiscoveryService, TransferService and
//! SaveSyncService together:
//! - Persistent device identity and resume records
//! - Peer discovery over UDP broadcast
//! - Package transfers over TCP
//! - Save offers routed from discovery into save sync
//!
//! # Example
//!
//! ```ignore
//! use lanshare_core::{LanShareNode, ShareConfig};
//!
//! let node = LanShareNode::new(ShareConfig::with_root("~/.lanshare")).await?;
//! node.start().await?;
//!
//! for peer in node.discovery().peers() {
//!     println!("{} ({} items)", peer.label(), peer.item_count);
//! }
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ShareConfig;
use crate::discovery::{DiscoveryEvent, DiscoveryService, MessageType, Peer};
use crate::error::ShareResult;
use crate::savesync::{OfferPublisher, SaveSyncService, SyncOffer, TransferSaveFetcher};
use crate::storage::Storage;
use crate::transfer::TransferService;

/// Resume records older than this belong to transfers nobody will resume
const STALE_TRANSFER_HOURS: i64 = 24;

/// One device on the LAN
pub struct LanShareNode {
    config: ShareConfig,
    storage: Storage,
    discovery: DiscoveryService,
    transfer: TransferService,
    saves: SaveSyncService,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl LanShareNode {
    /// Open (or create) the node's database under `config.data_dir` and build
    /// the services. Nothing touches the network until [`start`](Self::start).
    ///
    /// A device id already stored in the database wins over the configured
    /// one so clocks stay attributable across restarts.
    pub async fn new(mut config: ShareConfig) -> ShareResult<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.data_dir).await?;

        let storage = Storage::new(config.database_path())?;
        match storage.load_device_id()? {
            Some(stored) => config.device_id = stored,
            None => storage.save_device_id(&config.device_id)?,
        }

        let pruned = storage
            .prune_stale_transfer_states(chrono::Duration::hours(STALE_TRANSFER_HOURS))?;
        for key in pruned {
            debug!(destination = %key, "Dropped stale resume record");
        }

        let discovery = DiscoveryService::new(&config, Some(storage.clone()));
        let transfer = TransferService::new(&config, storage.clone())?;
        let publisher: Arc<dyn OfferPublisher> = Arc::new(discovery.clone());
        let saves = SaveSyncService::new(
            &config,
            storage.clone(),
            Arc::new(TransferSaveFetcher::new(transfer.clone())),
            Some(publisher),
        );
        transfer.set_save_provider(saves.save_provider());

        info!(device_id = %config.device_id, host = %config.host_name, "Node ready");

        Ok(Self {
            config,
            storage,
            discovery,
            transfer,
            saves,
            router: Mutex::new(None),
        })
    }

    /// Bind the transfer listener, then start announcing it.
    pub async fn start(&self) -> ShareResult<()> {
        let addr = self.transfer.start().await?;
        self.discovery.set_transfer_port(addr.port());
        self.refresh_item_count().await;
        self.discovery.start().await?;

        let events = self.discovery.subscribe();
        let task = tokio::spawn(route_discovery_events(
            events,
            self.discovery.clone(),
            self.saves.clone(),
        ));
        if let Some(previous) = self.router.lock().replace(task) {
            previous.abort();
        }

        info!(transfer = %addr, "Node started");
        Ok(())
    }

    /// Say goodbye, stop listening and cancel in-flight transfers.
    pub async fn stop(&self) {
        if let Some(task) = self.router.lock().take() {
            task.abort();
        }
        self.discovery.stop().await;
        self.transfer.stop().await;
        info!("Node stopped");
    }

    /// Re-scan the library and advertise the new item count.
    pub async fn refresh_item_count(&self) {
        match self.transfer.library_catalog().await {
            Ok(catalog) => {
                let count = u32::try_from(catalog.items.len()).unwrap_or(u32::MAX);
                self.discovery.set_item_count(count);
            }
            Err(e) => warn!(error = %e, "Library scan failed"),
        }
    }

    /// Ask every known peer to offer its latest version of `save_id`.
    /// Returns how many requests went out.
    pub async fn request_save_offers(&self, save_id: &str) -> ShareResult<usize> {
        let payload = serde_json::json!({ "save_id": save_id });
        let mut sent = 0;
        for peer in self.discovery.peers() {
            match self.discovery.send_save_request(&peer, payload.clone()).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %peer.label(), error = %e, "Save request not sent"),
            }
        }
        Ok(sent)
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn config(&self) -> &ShareConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    pub fn transfer(&self) -> &TransferService {
        &self.transfer
    }

    pub fn saves(&self) -> &SaveSyncService {
        &self.saves
    }
}

impl std::fmt::Debug for LanShareNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanShareNode")
            .field("device_id", &self.config.device_id)
            .field("host_name", &self.config.host_name)
            .finish_non_exhaustive()
    }
}

impl Drop for LanShareNode {
    fn drop(&mut self) {
        if let Some(task) = self.router.lock().take() {
            task.abort();
        }
    }
}

/// Feed save offers and requests from discovery into save sync
async fn route_discovery_events(
    mut events: broadcast::Receiver<DiscoveryEvent>,
    discovery: DiscoveryService,
    saves: SaveSyncService,
) {
    loop {
        match events.recv().await {
            Ok(DiscoveryEvent::SaveSyncOffer { peer, payload }) => {
                on_offer(&saves, &peer, &payload).await;
            }
            Ok(DiscoveryEvent::SaveSyncRequest { peer, payload }) => {
                on_request(&discovery, &saves, &peer, &payload).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Discovery events lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn on_offer(saves: &SaveSyncService, peer: &Peer, payload: &serde_json::Value) {
    let offer = match SyncOffer::from_payload(payload) {
        Ok(offer) => offer,
        Err(e) => {
            warn!(peer = %peer.label(), error = %e, "Malformed save offer");
            return;
        }
    };
    let save_id = offer.save_id.clone();
    match saves.handle_offer(offer, peer.address).await {
        Ok(decision) => debug!(%save_id, peer = %peer.label(), ?decision, "Save offer handled"),
        Err(e) => warn!(%save_id, peer = %peer.label(), error = %e, "Save offer failed"),
    }
}

async fn on_request(
    discovery: &DiscoveryService,
    saves: &SaveSyncService,
    peer: &Peer,
    payload: &serde_json::Value,
) {
    let Some(save_id) = payload.get("save_id").and_then(|v| v.as_str()) else {
        warn!(peer = %peer.label(), "Save request without save_id");
        return;
    };

    let offer = match saves.latest_offer(save_id) {
        Ok(Some(offer)) => offer,
        Ok(None) => {
            debug!(%save_id, "No version to offer");
            return;
        }
        Err(e) => {
            warn!(%save_id, error = %e, "Latest version lookup failed");
            return;
        }
    };

    let result = match offer.to_payload() {
        Ok(body) => {
            discovery
                .send_auxiliary(MessageType::SaveSyncOffer, Some(body), peer.discovery_address)
                .await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(%save_id, peer = %peer.label(), error = %e, "Save offer reply failed");
    }
}
