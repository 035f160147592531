//! Transfer service: listener, active-transfer registry, public API
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  TransferService                                                │
//! │  ├── accept loop (one task per inbound connection)             │
//! │  ├── active: transfer id -> (info, cancellation token)         │
//! │  ├── locks: destination dir -> async mutex (timeout acquire)   │
//! │  ├── approvals: mpsc of ApprovalRequest (default deny)         │
//! │  └── event_tx: broadcast::Sender<TransferEvent>                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog;
use super::events::{
    ApprovalRequest, Direction, IncomingTransfer, SpeedTestResult, TransferEvent, TransferInfo,
    TransferResult,
};
use super::protocol::LibraryCatalog;
use super::{receiver, sender};
use crate::config::ShareConfig;
use crate::crypto::ChannelCipher;
use crate::error::{ShareError, ShareResult};
use crate::locks::{KeyedGuard, KeyedLocks};
use crate::net::{handshake, BandwidthLimiter, FramedStream};
use crate::storage::Storage;

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Pending approval requests buffered for the collaborator
const APPROVAL_CHANNEL_CAPACITY: usize = 16;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum gap between two progress events of one transfer
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Resolves a save id to the directory served for `SaveRequest`s
pub trait SaveProvider: Send + Sync {
    fn save_dir(&self, save_id: &str) -> Option<PathBuf>;
}

struct Active {
    info: TransferInfo,
    cancel: CancellationToken,
}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// State shared by the service handle and its connection tasks
pub(crate) struct Shared {
    pub config: ShareConfig,
    pub storage: Storage,
    pub cipher: Option<ChannelCipher>,
    pub limiter: BandwidthLimiter,
    pub event_tx: broadcast::Sender<TransferEvent>,
    active: RwLock<HashMap<String, Active>>,
    locks: KeyedLocks<PathBuf>,
    approval_tx: mpsc::Sender<ApprovalRequest>,
    approval_rx: Mutex<Option<mpsc::Receiver<ApprovalRequest>>>,
    save_provider: RwLock<Option<Arc<dyn SaveProvider>>>,
    running: Mutex<Option<Running>>,
}

/// Removes a transfer from the registry when dropped
pub(crate) struct ActiveGuard {
    shared: Arc<Shared>,
    transfer_id: String,
    pub cancel: CancellationToken,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.shared.active.write().remove(&self.transfer_id);
    }
}

impl Shared {
    pub fn emit(&self, event: TransferEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Register an in-flight transfer and announce it.
    pub fn register(self: &Arc<Self>, info: TransferInfo) -> ActiveGuard {
        let cancel = CancellationToken::new();
        self.active.write().insert(
            info.transfer_id.clone(),
            Active {
                info: info.clone(),
                cancel: cancel.clone(),
            },
        );
        let transfer_id = info.transfer_id.clone();
        self.emit(TransferEvent::Started(info));
        ActiveGuard {
            shared: self.clone(),
            transfer_id,
            cancel,
        }
    }

    /// Ask the collaborator whether to accept. Declines on timeout, when no
    /// handler is registered, or when the request is dropped.
    pub async fn request_approval(&self, incoming: IncomingTransfer) -> bool {
        if self.config.auto_accept {
            return true;
        }
        let unhandled = self.approval_rx.lock().is_some();
        if unhandled {
            warn!(item = %incoming.item_name, "No approval handler registered, declining");
            return false;
        }

        let item = incoming.item_name.clone();
        let (request, response) = ApprovalRequest::new(incoming);
        if self.approval_tx.send(request).await.is_err() {
            return false;
        }
        match tokio::time::timeout(self.config.approval_timeout, response).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(%item, timeout = ?self.config.approval_timeout, "Approval timed out, declining");
                false
            }
        }
    }

    /// Serialize writers to the same destination directory.
    pub async fn lock_destination(&self, dir: &Path) -> ShareResult<KeyedGuard<PathBuf>> {
        self.locks
            .lock_timeout(dir.to_path_buf(), self.config.lock_timeout)
            .await
            .ok_or_else(|| ShareError::Timeout(format!("destination {} is busy", dir.display())))
    }

    pub fn save_dir(&self, save_id: &str) -> Option<PathBuf> {
        let provider = self.save_provider.read().clone();
        provider.and_then(|p| p.save_dir(save_id))
    }

    /// Handshake (when a key is configured) and wrap in frames.
    pub async fn open_initiator(&self, mut stream: TcpStream) -> ShareResult<FramedStream<TcpStream>> {
        stream.set_nodelay(true)?;
        if let Some(cipher) = &self.cipher {
            let outcome = handshake::initiate(
                &mut stream,
                cipher,
                &self.config.device_id,
                self.config.handshake_timeout,
            )
            .await?;
            debug!(peer_device = %outcome.peer_device_id, "Session authenticated");
        }
        Ok(FramedStream::new(stream, self.cipher.clone()))
    }

    pub async fn open_responder(&self, mut stream: TcpStream) -> ShareResult<FramedStream<TcpStream>> {
        stream.set_nodelay(true)?;
        if let Some(cipher) = &self.cipher {
            let outcome = handshake::respond(
                &mut stream,
                cipher,
                &self.config.device_id,
                self.config.handshake_timeout,
            )
            .await?;
            debug!(peer_device = %outcome.peer_device_id, "Session authenticated");
        }
        Ok(FramedStream::new(stream, self.cipher.clone()))
    }
}

/// Throttled progress events for one transfer
pub(crate) struct ProgressReporter<'a> {
    shared: &'a Shared,
    transfer_id: &'a str,
    total: u64,
    done: u64,
    last_emit: Option<Instant>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(shared: &'a Shared, transfer_id: &'a str, total: u64) -> Self {
        Self {
            shared,
            transfer_id,
            total,
            done: 0,
            last_emit: None,
        }
    }

    pub fn advance(&mut self, bytes: u64, file: &str) {
        self.done += bytes;
        let due = self
            .last_emit
            .map(|t| t.elapsed() >= PROGRESS_INTERVAL)
            .unwrap_or(true);
        if due || self.done >= self.total {
            self.emit(Some(file));
        }
    }

    pub fn emit(&mut self, file: Option<&str>) {
        self.last_emit = Some(Instant::now());
        self.shared.emit(TransferEvent::Progress {
            transfer_id: self.transfer_id.to_string(),
            bytes_done: self.done,
            bytes_total: self.total,
            current_file: file.map(str::to_string),
        });
    }
}

/// Transfer service handle. Cheap to clone.
#[derive(Clone)]
pub struct TransferService {
    pub(super) shared: Arc<Shared>,
}

impl std::fmt::Debug for TransferService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferService")
            .field("device_id", &self.shared.config.device_id)
            .field("local_addr", &self.local_addr())
            .field("active", &self.shared.active.read().len())
            .finish()
    }
}

impl TransferService {
    /// Create a stopped service. Fails when the configured key is invalid.
    pub fn new(config: &ShareConfig, storage: Storage) -> ShareResult<Self> {
        let cipher = config.channel_key()?.map(|key| ChannelCipher::new(&key));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (approval_tx, approval_rx) = mpsc::channel(APPROVAL_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(Shared {
                config: config.clone(),
                storage,
                cipher,
                limiter: BandwidthLimiter::new(config.bandwidth_limit),
                event_tx,
                active: RwLock::new(HashMap::new()),
                locks: KeyedLocks::new(),
                approval_tx,
                approval_rx: Mutex::new(Some(approval_rx)),
                save_provider: RwLock::new(None),
                running: Mutex::new(None),
            }),
        })
    }

    /// Subscribe to transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Take the approval request stream. Until this is called (and unless
    /// `auto_accept` is set) incoming packages are declined.
    pub fn approval_requests(&self) -> Option<mpsc::Receiver<ApprovalRequest>> {
        self.shared.approval_rx.lock().take()
    }

    /// Serve `SaveRequest`s from this provider
    pub fn set_save_provider(&self, provider: Arc<dyn SaveProvider>) {
        *self.shared.save_provider.write() = Some(provider);
    }

    /// Change the outgoing bandwidth cap (bytes/sec, 0 = unlimited)
    pub fn set_bandwidth_limit(&self, bytes_per_sec: u64) {
        self.shared.limiter.set_rate(bytes_per_sec);
    }

    /// Bind the listener and start accepting. Idempotent; returns the bound
    /// address.
    pub async fn start(&self) -> ShareResult<SocketAddr> {
        let mut running = self.shared.running.lock();
        if let Some(r) = running.as_ref() {
            return Ok(r.local_addr);
        }

        let listener = bind_listener(self.shared.config.transfer_bind_addr())?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(self.shared.clone(), listener, cancel.clone()));

        *running = Some(Running {
            local_addr,
            cancel,
            task,
        });
        info!(%local_addr, "Transfer service listening");
        Ok(local_addr)
    }

    /// Stop accepting and cancel every active transfer. Idempotent.
    pub async fn stop(&self) {
        let running = self.shared.running.lock().take();
        let Some(running) = running else {
            return;
        };
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Accept loop ended abnormally");
            }
        }

        let tokens: Vec<CancellationToken> = self
            .shared
            .active
            .read()
            .values()
            .map(|a| a.cancel.clone())
            .collect();
        for token in tokens {
            token.cancel();
        }
        info!("Transfer service stopped");
    }

    /// Listener address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// In-flight transfers
    pub fn active_transfers(&self) -> Vec<TransferInfo> {
        let mut list: Vec<TransferInfo> = self
            .shared
            .active
            .read()
            .values()
            .map(|a| a.info.clone())
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        list
    }

    /// Cancel one transfer. Returns whether it was active.
    pub fn cancel_transfer(&self, transfer_id: &str) -> bool {
        let token = self
            .shared
            .active
            .read()
            .get(transfer_id)
            .map(|a| a.cancel.clone());
        match token {
            Some(token) => {
                info!(%transfer_id, "Cancelling transfer");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Send a directory tree (or single file) to `peer`.
    pub async fn send_package(&self, peer: SocketAddr, source: &Path) -> TransferResult {
        let transfer_id = ulid::Ulid::new().to_string();
        if let Err(e) = tokio::fs::metadata(source).await {
            let error = ShareError::NotFound(format!("{}: {}", source.display(), e));
            return self.failed(&transfer_id, Direction::Send, &error);
        }
        let framed = match self.connect(peer).await {
            Ok(f) => f,
            Err(e) => {
                warn!(%peer, error = %e, "Could not open transfer session");
                return self.failed(&transfer_id, Direction::Send, &e);
            }
        };
        self.send_on(framed, peer, transfer_id, source).await
    }

    /// Send over an already connected stream (e.g. from a hole punch).
    pub async fn send_package_over(&self, stream: TcpStream, source: &Path) -> TransferResult {
        let transfer_id = ulid::Ulid::new().to_string();
        let peer = match stream.peer_addr() {
            Ok(p) => p,
            Err(e) => return self.failed(&transfer_id, Direction::Send, &e.into()),
        };
        let framed = match self.shared.open_initiator(stream).await {
            Ok(f) => f,
            Err(e) => return self.failed(&transfer_id, Direction::Send, &e),
        };
        self.send_on(framed, peer, transfer_id, source).await
    }

    /// Treat an already connected stream as an inbound connection.
    pub fn serve_connection(&self, stream: TcpStream) -> ShareResult<()> {
        let peer = stream.peer_addr()?;
        let shared = self.shared.clone();
        tokio::spawn(async move { receiver::handle_connection(shared, stream, peer).await });
        Ok(())
    }

    /// Fetch the catalog of `peer`'s library.
    pub async fn list_peer_library(&self, peer: SocketAddr) -> ShareResult<LibraryCatalog> {
        let mut framed = self.connect(peer).await?;
        sender::request_catalog(&self.shared, &mut framed).await
    }

    /// Our own library catalog
    pub async fn library_catalog(&self) -> ShareResult<LibraryCatalog> {
        let dir = self.shared.config.library_dir.clone();
        super::run_blocking(move || catalog::scan(&dir)).await
    }

    /// Push `bytes` of filler through the limiter to `peer` and time it.
    pub async fn speed_test(&self, peer: SocketAddr, bytes: u64) -> ShareResult<SpeedTestResult> {
        let mut framed = self.connect(peer).await?;
        let transfer_id = ulid::Ulid::new().to_string();
        let guard = self.shared.register(TransferInfo {
            transfer_id: transfer_id.clone(),
            direction: Direction::Send,
            peer,
            item_name: "speed-test".into(),
            total_bytes: bytes,
            started_at: Utc::now(),
        });
        let result =
            sender::run_speed_test(&self.shared, &mut framed, &transfer_id, bytes, &guard.cancel).await;
        if let Err(e) = &result {
            self.failed(&transfer_id, Direction::Send, e);
        }
        result
    }

    /// Pull the current contents of save `save_id` from `peer` into
    /// `destination`. The destination is replaced file by file only after
    /// every file verified.
    pub async fn request_save(
        &self,
        peer: SocketAddr,
        save_id: &str,
        destination: &Path,
    ) -> TransferResult {
        let transfer_id = ulid::Ulid::new().to_string();
        let result = async {
            let mut framed = self.connect(peer).await?;
            receiver::fetch_save(&self.shared, &mut framed, peer, &transfer_id, save_id, destination)
                .await
        }
        .await;

        match result {
            Ok(result) => result,
            Err(e) => {
                warn!(%peer, save_id, error = %e, "Save request failed");
                self.failed(&transfer_id, Direction::Receive, &e)
            }
        }
    }

    async fn send_on(
        &self,
        mut framed: FramedStream<TcpStream>,
        peer: SocketAddr,
        transfer_id: String,
        source: &Path,
    ) -> TransferResult {
        let item_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let outcome = sender::send_package(
            &self.shared,
            &mut framed,
            peer,
            &transfer_id,
            &item_name,
            source,
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(%peer, %transfer_id, error = %e, "Send failed");
                self.failed(&transfer_id, Direction::Send, &e)
            }
        }
    }

    async fn connect(&self, peer: SocketAddr) -> ShareResult<FramedStream<TcpStream>> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
            .await
            .map_err(|_| ShareError::Timeout(format!("connect to {}", peer)))??;
        self.shared.open_initiator(stream).await
    }

    fn failed(&self, transfer_id: &str, direction: Direction, error: &ShareError) -> TransferResult {
        self.shared.emit(TransferEvent::Failed {
            transfer_id: transfer_id.to_string(),
            direction,
            error: error.to_string(),
        });
        TransferResult::failed(transfer_id, error)
    }
}

fn bind_listener(addr: SocketAddr) -> ShareResult<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            r = listener.accept() => r,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "Accepted transfer connection");
                let shared = shared.clone();
                tokio::spawn(async move { receiver::handle_connection(shared, stream, peer).await });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
