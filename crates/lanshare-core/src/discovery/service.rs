//! UDP presence protocol
//!
//! Three background tasks share one socket:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  announce   jittered startup, 3 fast announces, then steady     │
//! │  listen     parse, validate magic, drop self, update peers      │
//! │  sweep      every 5s evict silent non-manual peers              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Send and receive errors are logged and retried; nothing here is fatal
//! once the socket is bound.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::events::DiscoveryEvent;
use super::message::{DiscoveryMessage, MessageType, MAX_DATAGRAM_SIZE};
use super::peers::{ManualPeer, Observation, Peer, PeerTable, Sighting};
use crate::config::ShareConfig;
use crate::error::{is_transient_io, ShareError, ShareResult};
use crate::storage::Storage;

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

const STARTUP_JITTER_MS: u64 = 1000;
const FAST_ANNOUNCE_COUNT: u32 = 3;
const FAST_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);
const FAST_ANNOUNCE_JITTER_MS: i64 = 250;
const STEADY_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const STEADY_ANNOUNCE_JITTER_MS: i64 = 1000;

/// How often silent peers are evicted
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Wait after a socket error before trying again
const SOCKET_RETRY_DELAY: Duration = Duration::from_secs(5);

struct Running {
    socket: Arc<UdpSocket>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    device_id: String,
    host_name: String,
    bind_addr: SocketAddr,
    /// Port assumed for manual peers' discovery sockets
    discovery_port: u16,
    peer_timeout: Duration,
    announce_targets: RwLock<Vec<SocketAddr>>,
    transfer_port: AtomicU16,
    item_count: AtomicU32,
    storage: Option<Storage>,
    peers: RwLock<PeerTable>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
    running: Mutex<Option<Running>>,
}

/// Discovery service handle. Cheap to clone.
#[derive(Clone)]
pub struct DiscoveryService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("device_id", &self.inner.device_id)
            .field("running", &self.is_running())
            .field("peers", &self.inner.peers.read().len())
            .finish()
    }
}

impl DiscoveryService {
    /// Create a stopped service. `storage` enables persisted manual peers.
    pub fn new(config: &ShareConfig, storage: Option<Storage>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                device_id: config.device_id.clone(),
                host_name: config.host_name.clone(),
                bind_addr: config.discovery_bind_addr(),
                discovery_port: config.discovery_port,
                peer_timeout: config.peer_timeout,
                announce_targets: RwLock::new(config.effective_announce_targets()),
                transfer_port: AtomicU16::new(config.transfer_port),
                item_count: AtomicU32::new(0),
                storage,
                peers: RwLock::new(PeerTable::new()),
                event_tx,
                running: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to discovery events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Bind the socket and start the background loops. Idempotent.
    pub async fn start(&self) -> ShareResult<()> {
        let mut running = self.inner.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let socket = Arc::new(bind_socket(self.inner.bind_addr)?);
        let local = socket.local_addr()?;
        self.restore_manual_peers();

        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(announce_loop(
                self.inner.clone(),
                socket.clone(),
                cancel.clone(),
            )),
            tokio::spawn(listen_loop(
                self.inner.clone(),
                socket.clone(),
                cancel.clone(),
            )),
            tokio::spawn(sweep_loop(self.inner.clone(), cancel.clone())),
        ];

        *running = Some(Running {
            socket,
            cancel,
            tasks,
        });
        info!(%local, device_id = %self.inner.device_id, "Discovery started");
        Ok(())
    }

    /// Say goodbye and stop the background loops. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };

        let goodbye = self.inner.message(MessageType::Goodbye);
        if let Err(e) = self.inner.send_to_targets(&running.socket, &goodbye).await {
            debug!(error = %e, "Goodbye not delivered");
        }

        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Discovery task ended abnormally");
                }
            }
        }
        info!(device_id = %self.inner.device_id, "Discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Address the discovery socket is bound to, while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .running
            .lock()
            .as_ref()
            .and_then(|r| r.socket.local_addr().ok())
    }

    /// Transfer port advertised in announces
    pub fn set_transfer_port(&self, port: u16) {
        self.inner.transfer_port.store(port, Ordering::Relaxed);
    }

    /// Packaged item count advertised in announces
    pub fn set_item_count(&self, count: u32) {
        self.inner.item_count.store(count, Ordering::Relaxed);
    }

    /// Replace the announce destinations
    pub fn set_announce_targets(&self, targets: Vec<SocketAddr>) {
        *self.inner.announce_targets.write() = targets;
    }

    /// Snapshot of all known peers
    pub fn peers(&self) -> Vec<Peer> {
        self.inner.peers.read().list()
    }

    /// Peer by transfer address
    pub fn peer(&self, address: &SocketAddr) -> Option<Peer> {
        self.inner.peers.read().get(address)
    }

    /// Peer by device id
    pub fn peer_by_device(&self, device_id: &str) -> Option<Peer> {
        self.inner.peers.read().get_by_device(device_id)
    }

    /// Register a peer outside the broadcast mechanism.
    ///
    /// `address` is the peer's transfer endpoint. The peer is persisted when
    /// storage is configured and is never removed by the liveness sweep.
    pub fn add_manual_peer(
        &self,
        address: SocketAddr,
        host_name: Option<String>,
    ) -> ShareResult<Peer> {
        let record = ManualPeer {
            address,
            host_name,
            added_at: Utc::now(),
        };
        if let Some(storage) = &self.inner.storage {
            storage.save_manual_peer(&record)?;
        }
        let peer = self.inner.insert_manual(&record);
        info!(peer = %peer.label(), "Added manual peer");
        Ok(peer)
    }

    /// Forget a manual peer. Returns whether it was known.
    pub fn remove_manual_peer(&self, address: SocketAddr) -> ShareResult<bool> {
        if let Some(storage) = &self.inner.storage {
            storage.remove_manual_peer(&address)?;
        }
        let removed = self.inner.peers.write().remove_manual(address);
        match removed {
            Some(peer) => {
                info!(peer = %peer.label(), "Removed manual peer");
                self.inner.emit(DiscoveryEvent::PeerLost(peer));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Tell `peer` a package is coming.
    pub async fn send_transfer_request(
        &self,
        peer: &Peer,
        item_name: &str,
        item_size: u64,
    ) -> ShareResult<()> {
        let mut message = self.inner.message(MessageType::TransferRequest);
        message.item_name = Some(item_name.to_string());
        message.item_size = Some(item_size);
        self.send_message(&message, peer.discovery_address).await
    }

    /// Publish a save offer to every known peer. Returns how many were sent.
    pub async fn send_save_offer(&self, payload: serde_json::Value) -> ShareResult<usize> {
        let mut message = self.inner.message(MessageType::SaveSyncOffer);
        message.save_sync_payload = Some(payload);

        let mut targets: Vec<SocketAddr> =
            self.peers().into_iter().map(|p| p.discovery_address).collect();
        targets.sort();
        targets.dedup();

        let mut sent = 0;
        for target in targets {
            match self.send_message(&message, target).await {
                Ok(()) => sent += 1,
                Err(e @ ShareError::PayloadTooLarge { .. }) => return Err(e),
                Err(e) => warn!(%target, error = %e, "Save offer not sent"),
            }
        }
        Ok(sent)
    }

    /// Ask `peer` to offer its latest version of a save.
    pub async fn send_save_request(
        &self,
        peer: &Peer,
        payload: serde_json::Value,
    ) -> ShareResult<()> {
        let mut message = self.inner.message(MessageType::SaveSyncRequest);
        message.save_sync_payload = Some(payload);
        self.send_message(&message, peer.discovery_address).await
    }

    /// Send an arbitrary small message to one target.
    ///
    /// Bulk listings and oversized payloads are refused with an error and a
    /// warning; they are never truncated.
    pub async fn send_auxiliary(
        &self,
        message_type: MessageType,
        payload: Option<serde_json::Value>,
        target: SocketAddr,
    ) -> ShareResult<()> {
        let mut message = self.inner.message(message_type);
        message.save_sync_payload = payload;
        self.send_message(&message, target).await
    }

    /// Process one received datagram. Exposed for tests driving the service
    /// without sockets.
    pub fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        self.inner.handle_datagram(data, src);
    }

    /// Evict peers silent for longer than the timeout as of `now`.
    pub fn sweep(&self, now: Instant) -> Vec<Peer> {
        self.inner.sweep(now)
    }

    async fn send_message(&self, message: &DiscoveryMessage, target: SocketAddr) -> ShareResult<()> {
        let bytes = message.encode().inspect_err(|e| {
            warn!(message_type = ?message.message_type, error = %e, "Refusing discovery message");
        })?;
        let socket = self
            .inner
            .running
            .lock()
            .as_ref()
            .map(|r| r.socket.clone())
            .ok_or_else(|| ShareError::InvalidOperation("discovery is not running".into()))?;
        socket.send_to(&bytes, target).await?;
        trace!(%target, message_type = ?message.message_type, "Sent discovery message");
        Ok(())
    }

    fn restore_manual_peers(&self) {
        let Some(storage) = &self.inner.storage else {
            return;
        };
        match storage.list_manual_peers() {
            Ok(records) => {
                for record in &records {
                    self.inner.insert_manual(record);
                }
                if !records.is_empty() {
                    info!(count = records.len(), "Restored manual peers");
                }
            }
            Err(e) => warn!(error = %e, "Could not load manual peers"),
        }
    }
}

impl Inner {
    fn message(&self, message_type: MessageType) -> DiscoveryMessage {
        DiscoveryMessage::new(
            message_type,
            &self.device_id,
            &self.host_name,
            self.transfer_port.load(Ordering::Relaxed),
            self.item_count.load(Ordering::Relaxed),
        )
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    fn insert_manual(&self, record: &ManualPeer) -> Peer {
        let peer = Peer {
            address: record.address,
            discovery_address: SocketAddr::new(record.address.ip(), self.discovery_port),
            device_id: None,
            host_name: record.host_name.clone().unwrap_or_default(),
            item_count: 0,
            manual: true,
            last_seen: record.added_at,
        };
        let (peer, is_new) = self.peers.write().add_manual(peer, Instant::now());
        if is_new {
            self.emit(DiscoveryEvent::PeerDiscovered(peer.clone()));
        }
        peer
    }

    async fn send_to_targets(
        &self,
        socket: &UdpSocket,
        message: &DiscoveryMessage,
    ) -> ShareResult<()> {
        let bytes = message.encode()?;
        let targets = self.announce_targets.read().clone();

        let mut first_error = None;
        for target in targets {
            if let Err(e) = socket.send_to(&bytes, target).await {
                debug!(%target, error = %e, "Announce send failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let message = match DiscoveryMessage::decode(data) {
            Ok(m) => m,
            Err(e) => {
                debug!(%src, error = %e, "Ignoring datagram");
                return;
            }
        };
        if message.device_id == self.device_id {
            return;
        }

        if message.message_type == MessageType::Goodbye {
            let removed = self.peers.write().remove_device(&message.device_id);
            if let Some(peer) = removed {
                info!(peer = %peer.label(), "Peer said goodbye");
                self.emit(DiscoveryEvent::PeerLost(peer));
            }
            return;
        }
        if message.message_type.is_deprecated() {
            warn!(%src, message_type = ?message.message_type, "Ignoring deprecated discovery message");
            return;
        }

        let peer = self.observe(&message, src);

        match message.message_type {
            MessageType::Announce => {}
            MessageType::TransferRequest => match message.item_name {
                Some(item_name) => self.emit(DiscoveryEvent::TransferRequest {
                    peer,
                    item_name,
                    item_size: message.item_size.unwrap_or(0),
                }),
                None => debug!(%src, "Transfer request without item name"),
            },
            MessageType::SaveSyncOffer => match message.save_sync_payload {
                Some(payload) => self.emit(DiscoveryEvent::SaveSyncOffer { peer, payload }),
                None => debug!(%src, "Save offer without payload"),
            },
            MessageType::SaveSyncRequest => match message.save_sync_payload {
                Some(payload) => self.emit(DiscoveryEvent::SaveSyncRequest { peer, payload }),
                None => debug!(%src, "Save request without payload"),
            },
            MessageType::Goodbye | MessageType::LibraryList => {}
        }
    }

    /// Update liveness and emit discovery/loss events for the sender.
    fn observe(&self, message: &DiscoveryMessage, src: SocketAddr) -> Peer {
        let sighting = Sighting {
            device_id: &message.device_id,
            host_name: &message.host_name,
            address: SocketAddr::new(src.ip(), message.transfer_port),
            discovery_address: src,
            item_count: message.packaged_item_count,
        };

        let observation = self.peers.write().observe(sighting, Instant::now());
        match observation {
            Observation::New(peer) => {
                info!(peer = %peer.label(), device_id = %message.device_id, "Discovered peer");
                self.emit(DiscoveryEvent::PeerDiscovered(peer.clone()));
                peer
            }
            Observation::Moved { old, new } => {
                info!(from = %old.address, to = %new.address, "Peer changed address");
                self.emit(DiscoveryEvent::PeerLost(old));
                self.emit(DiscoveryEvent::PeerDiscovered(new.clone()));
                new
            }
            Observation::Refreshed => {
                let peer = self.peers.read().get_by_device(&message.device_id);
                // Present: we just inserted it under the write lock above
                peer.unwrap_or_else(|| Peer {
                    address: SocketAddr::new(src.ip(), message.transfer_port),
                    discovery_address: src,
                    device_id: Some(message.device_id.clone()),
                    host_name: message.host_name.clone(),
                    item_count: message.packaged_item_count,
                    manual: false,
                    last_seen: Utc::now(),
                })
            }
        }
    }

    fn sweep(&self, now: Instant) -> Vec<Peer> {
        let removed = self.peers.write().sweep(now, self.peer_timeout);
        for peer in &removed {
            info!(peer = %peer.label(), "Peer timed out");
            self.emit(DiscoveryEvent::PeerLost(peer.clone()));
        }
        removed
    }
}

fn bind_socket(addr: SocketAddr) -> ShareResult<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn jittered(base: Duration, jitter_ms: i64) -> Duration {
    let offset = rand::rng().random_range(-jitter_ms..=jitter_ms);
    let millis = base.as_millis() as i64 + offset;
    Duration::from_millis(millis.max(0) as u64)
}

/// Sleep unless cancelled first. Returns true when cancelled.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

async fn announce_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let startup = Duration::from_millis(rand::rng().random_range(0..=STARTUP_JITTER_MS));
    if sleep_or_cancel(&cancel, startup).await {
        return;
    }

    let mut sent = 0u32;
    loop {
        let announce = inner.message(MessageType::Announce);
        let delay = match inner.send_to_targets(&socket, &announce).await {
            Ok(()) => {
                sent = sent.saturating_add(1);
                if sent <= FAST_ANNOUNCE_COUNT {
                    jittered(FAST_ANNOUNCE_INTERVAL, FAST_ANNOUNCE_JITTER_MS)
                } else {
                    jittered(STEADY_ANNOUNCE_INTERVAL, STEADY_ANNOUNCE_JITTER_MS)
                }
            }
            Err(e) => {
                warn!(error = %e, "Announce failed, retrying");
                SOCKET_RETRY_DELAY
            }
        };
        if sleep_or_cancel(&cancel, delay).await {
            return;
        }
    }
}

async fn listen_loop(inner: Arc<Inner>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    // Larger than MAX_DATAGRAM_SIZE so oversized datagrams are seen whole and rejected
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE * 8];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return,
            r = socket.recv_from(&mut buf) => r,
        };
        match received {
            Ok((len, src)) => inner.handle_datagram(&buf[..len], src),
            // ICMP echoes of earlier sends on some platforms
            Err(e) if is_transient_io(e.kind()) => {
                trace!(error = %e, "Transient receive error");
            }
            Err(e) => {
                warn!(error = %e, "Discovery receive failed, retrying");
                if sleep_or_cancel(&cancel, SOCKET_RETRY_DELAY).await {
                    return;
                }
            }
        }
    }
}

async fn sweep_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                inner.sweep(Instant::now());
            }
        }
    }
}
