//! Incoming flows: connection dispatch, package receive, save fetch
//!
//! Files are received into a staging directory next to the destination and
//! only moved into place once every file has been verified, so a failed or
//! cancelled transfer never leaves a half-written package at the destination.
//! The resume record is written when receiving begins and after every
//! verified file.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::catalog;
use super::events::{Direction, IncomingTransfer, TransferEvent, TransferInfo, TransferResult, TransferStats};
use super::manifest::{safe_item_name, safe_relative_path, total_size, Manifest, PackageHashes};
use super::protocol::{
    decompress_block, max_compressed_frame, Ack, Completion, TransferHeader, TransferType,
    FILE_CHUNK_SIZE, MAX_SPEED_TEST_BYTES,
};
use super::run_blocking;
use super::sender;
use super::service::{ProgressReporter, Shared};
use super::state::{plan_resume, ResumeDecision, TransferState};
use crate::config::CompressionMode;
use crate::error::{ShareError, ShareResult};
use crate::net::{cancellable, FramedStream};

/// Staging area, relative to the destination's parent directory
pub const STAGING_DIR: &str = ".lanshare-incoming";

const WRITE_CHECK_FILE: &str = ".lanshare-write-check";

/// Where a package lands
#[derive(Debug, Clone)]
pub(crate) struct Destination {
    pub final_dir: PathBuf,
    pub staging_dir: PathBuf,
    /// Remove files under `final_dir` that the manifest does not list
    pub mirror: bool,
}

impl Destination {
    /// `<receive_dir>/<item>` for pushed packages
    fn in_receive_dir(receive_dir: &Path, item: &str) -> Self {
        Self {
            final_dir: receive_dir.join(item),
            staging_dir: receive_dir.join(STAGING_DIR).join(item),
            mirror: false,
        }
    }

    /// Exact directory whose contents are replaced (save fetches)
    fn replacing(dir: &Path) -> Self {
        let parent = dir.parent().unwrap_or_else(|| Path::new("."));
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "save".into());
        Self {
            final_dir: dir.to_path_buf(),
            staging_dir: parent.join(STAGING_DIR).join(name),
            mirror: true,
        }
    }

    fn state_key(&self) -> String {
        self.final_dir.to_string_lossy().into_owned()
    }
}

/// What the receiver decided before acking
struct ReceivePlan {
    state: TransferState,
    /// Files the sender must not send, in manifest order
    skipped: Vec<String>,
    /// Already staged from an earlier attempt
    resumed: BTreeSet<String>,
}

/// Serve one inbound connection to completion.
pub(crate) async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let mut framed = match shared.open_responder(stream).await {
        Ok(f) => f,
        Err(e) => {
            warn!(%peer, error = %e, "Rejected transfer connection");
            return;
        }
    };

    let header: TransferHeader =
        match tokio::time::timeout(shared.config.handshake_timeout, framed.recv()).await {
            Ok(Ok(h)) => h,
            Ok(Err(e)) => {
                warn!(%peer, error = %e, "Unreadable transfer header");
                return;
            }
            Err(_) => {
                warn!(%peer, "Peer sent no transfer header");
                return;
            }
        };
    if let Err(e) = header.validate() {
        warn!(%peer, error = %e, "Rejected transfer header");
        return;
    }

    debug!(%peer, kind = ?header.transfer_type, transfer_id = %header.transfer_id, "Inbound request");
    let (direction, result) = match header.transfer_type {
        TransferType::Package => (
            Direction::Receive,
            receive_package(&shared, &mut framed, peer, &header, None)
                .await
                .map(|_| ()),
        ),
        TransferType::ListRequest => (Direction::Send, serve_catalog(&shared, &mut framed).await),
        TransferType::SpeedTest => (
            Direction::Receive,
            sink_speed_test(&shared, &mut framed, &header).await,
        ),
        TransferType::SaveRequest => (
            Direction::Send,
            sender::serve_save_request(&shared, &mut framed, peer, &header).await,
        ),
    };

    if let Err(e) = result {
        match &e {
            ShareError::Declined(_) | ShareError::Cancelled | ShareError::NotFound(_) => {
                info!(%peer, transfer_id = %header.transfer_id, reason = %e, "Inbound request ended")
            }
            _ => warn!(%peer, transfer_id = %header.transfer_id, error = %e, "Inbound request failed"),
        }
        if matches!(
            header.transfer_type,
            TransferType::Package | TransferType::SaveRequest
        ) {
            shared.emit(TransferEvent::Failed {
                transfer_id: header.transfer_id.clone(),
                direction,
                error: e.to_string(),
            });
        }
    }
    let _ = framed.shutdown().await;
}

/// Ask `peer` for save `save_id` and receive it over `destination`.
pub(crate) async fn fetch_save<S>(
    shared: &Arc<Shared>,
    framed: &mut FramedStream<S>,
    peer: SocketAddr,
    transfer_id: &str,
    save_id: &str,
    destination: &Path,
) -> ShareResult<TransferResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = TransferHeader::new(
        TransferType::SaveRequest,
        transfer_id,
        shared.config.device_id.clone(),
        save_id,
    );
    framed.send(&request).await?;
    framed.flush().await?;

    let ack: Ack = tokio::time::timeout(shared.config.handshake_timeout, framed.recv())
        .await
        .map_err(|_| ShareError::Timeout("waiting for save request answer".into()))??;
    if !ack.accepted {
        return Err(ShareError::Declined(
            ack.reason.unwrap_or_else(|| "save request declined".into()),
        ));
    }

    let header: TransferHeader = framed.recv().await?;
    header.validate()?;
    if header.transfer_type != TransferType::Package {
        return Err(ShareError::Protocol(format!(
            "expected package after save request, got {:?}",
            header.transfer_type
        )));
    }
    receive_package(shared, framed, peer, &header, Some(destination)).await
}

/// Receive one package. With `target` unset the package lands in the receive
/// directory under its item name after approval; otherwise it replaces
/// `target` without asking.
async fn receive_package<S>(
    shared: &Arc<Shared>,
    framed: &mut FramedStream<S>,
    peer: SocketAddr,
    header: &TransferHeader,
    target: Option<&Path>,
) -> ShareResult<TransferResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let manifest: Manifest = tokio::time::timeout(shared.config.handshake_timeout, framed.recv())
        .await
        .map_err(|_| ShareError::Timeout("waiting for manifest".into()))??;

    let dest = match check_offer(header, &manifest).and_then(|_| match target {
        Some(dir) => Ok(Destination::replacing(dir)),
        None => safe_item_name(&header.item_name)
            .map(|item| Destination::in_receive_dir(&shared.config.receive_dir, item)),
    }) {
        Ok(dest) => dest,
        Err(e) => return decline(framed, e).await,
    };

    if target.is_none() {
        let incoming = IncomingTransfer {
            transfer_id: header.transfer_id.clone(),
            peer,
            peer_device: header.sender_device.clone(),
            item_name: header.item_name.clone(),
            total_files: manifest.total_files,
            total_size: manifest.total_bytes,
        };
        if !shared.request_approval(incoming).await {
            return decline(framed, ShareError::Declined("declined by receiver".into())).await;
        }
    }

    let _lock = match shared.lock_destination(&dest.final_dir).await {
        Ok(lock) => lock,
        Err(e) => return decline(framed, e).await,
    };

    let plan = match prepare(shared, &header.transfer_id, &header.item_name, &manifest, &dest).await {
        Ok(plan) => plan,
        Err(e) => return decline(framed, e).await,
    };

    framed.send(&Ack::accept(plan.skipped.clone())).await?;
    framed.flush().await?;

    let guard = shared.register(TransferInfo {
        transfer_id: header.transfer_id.clone(),
        direction: Direction::Receive,
        peer,
        item_name: header.item_name.clone(),
        total_bytes: manifest.total_bytes,
        started_at: Utc::now(),
    });
    let started = Instant::now();

    let mut stats = TransferStats {
        files_skipped: plan.skipped.len() as u64,
        ..Default::default()
    };
    let mut state = plan.state;
    receive_files(
        shared,
        framed,
        &manifest,
        header.compression,
        &dest,
        &plan.skipped,
        &mut state,
        &mut stats,
        &guard.cancel,
    )
    .await?;

    let staged: BTreeSet<String> = state.completed_files.clone();
    let manifest_copy = manifest.clone();
    let dest_copy = dest.clone();
    let hashes = run_blocking(move || finalize(&dest_copy, &manifest_copy, &staged)).await?;
    shared.storage.save_package_hashes(&dest.final_dir, &hashes)?;
    shared.storage.delete_transfer_state(&dest.state_key())?;
    debug!(resumed = plan.resumed.len(), "Package moved into place");

    framed.send(&Completion::ok()).await?;
    framed.flush().await?;

    stats.wire_bytes = framed.bytes_read();
    stats.elapsed = started.elapsed();
    info!(
        transfer_id = %header.transfer_id,
        item = %header.item_name,
        files = stats.files_transferred,
        skipped = stats.files_skipped,
        "Package received"
    );
    shared.emit(TransferEvent::Completed {
        transfer_id: header.transfer_id.clone(),
        direction: Direction::Receive,
        stats: stats.clone(),
    });
    Ok(TransferResult::succeeded(
        header.transfer_id.clone(),
        plan.skipped,
        stats,
    ))
}

fn check_offer(header: &TransferHeader, manifest: &Manifest) -> ShareResult<()> {
    manifest.validate()?;
    if manifest.total_files != header.total_files || manifest.total_bytes != header.total_size {
        return Err(ShareError::Protocol(format!(
            "header announces {} files / {} bytes, manifest has {} / {}",
            header.total_files, header.total_size, manifest.total_files, manifest.total_bytes
        )));
    }
    Ok(())
}

/// Tell the sender no, then surface `error`.
async fn decline<S, T>(framed: &mut FramedStream<S>, error: ShareError) -> ShareResult<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let reason = match &error {
        ShareError::Declined(reason) => reason.clone(),
        other => other.to_string(),
    };
    if framed.send(&Ack::decline(reason)).await.is_ok() {
        let _ = framed.flush().await;
    }
    Err(error)
}

/// Resume decision, skip set, space check and initial resume record.
async fn prepare(
    shared: &Shared,
    transfer_id: &str,
    item_name: &str,
    manifest: &Manifest,
    dest: &Destination,
) -> ShareResult<ReceivePlan> {
    let manifest_hash = manifest.content_hash()?;
    let key = dest.state_key();
    let stored = shared.storage.load_transfer_state(&key)?;
    let decision = plan_resume(stored.as_ref(), manifest, &manifest_hash, &dest.staging_dir);

    let mut state = TransferState::new(transfer_id, item_name, manifest, manifest_hash);
    let resumed = match decision {
        ResumeDecision::Fresh => {
            clear_dir(&dest.staging_dir)?;
            BTreeSet::new()
        }
        ResumeDecision::Discard => {
            info!(item = item_name, "Package changed since the interrupted attempt, starting over");
            shared.storage.delete_transfer_state(&key)?;
            clear_dir(&dest.staging_dir)?;
            BTreeSet::new()
        }
        ResumeDecision::Resume(done) => {
            info!(item = item_name, already = done.len(), "Resuming interrupted transfer");
            if let Some(previous) = &stored {
                state.started_at = previous.started_at;
            }
            let index = manifest.index();
            for path in &done {
                if let Some(entry) = index.get(path.as_str()) {
                    state.mark_completed(path, entry.size);
                }
            }
            done
        }
    };

    // Files already present with identical content need not be sent again
    let cached = shared.storage.load_package_hashes(&dest.final_dir)?.unwrap_or_default();
    let final_dir = dest.final_dir.clone();
    let candidates = manifest.clone();
    let resumed_copy = resumed.clone();
    let present: BTreeSet<String> = run_blocking(move || {
        let mut present = BTreeSet::new();
        for entry in &candidates.entries {
            if resumed_copy.contains(&entry.path) {
                continue;
            }
            match cached.current_hash(&final_dir, &entry.path, entry.size) {
                Ok(Some(hash)) if hash == entry.hash => {
                    present.insert(entry.path.clone());
                }
                Ok(_) => {}
                Err(e) => warn!(path = %entry.path, error = %e, "Could not hash existing file"),
            }
        }
        Ok(present)
    })
    .await?;

    let skipped: Vec<String> = manifest
        .entries
        .iter()
        .filter(|e| resumed.contains(&e.path) || present.contains(&e.path))
        .map(|e| e.path.clone())
        .collect();
    let needed = total_size(
        manifest
            .entries
            .iter()
            .filter(|e| !resumed.contains(&e.path) && !present.contains(&e.path)),
    )
    .ok_or_else(|| ShareError::Protocol("manifest file sizes overflow".into()))?;

    let staging = dest.staging_dir.clone();
    run_blocking(move || ensure_capacity(&staging, needed)).await?;

    shared.storage.save_transfer_state(&key, &state)?;
    Ok(ReceivePlan {
        state,
        skipped,
        resumed,
    })
}

#[allow(clippy::too_many_arguments)]
async fn receive_files<S>(
    shared: &Shared,
    framed: &mut FramedStream<S>,
    manifest: &Manifest,
    compression: CompressionMode,
    dest: &Destination,
    skipped: &[String],
    state: &mut TransferState,
    stats: &mut TransferStats,
    cancel: &CancellationToken,
) -> ShareResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = dest.state_key();
    let skip: BTreeSet<&str> = skipped.iter().map(String::as_str).collect();
    let pending_bytes = total_size(
        manifest
            .entries
            .iter()
            .filter(|e| !skip.contains(e.path.as_str())),
    )
    .ok_or_else(|| ShareError::Protocol("manifest file sizes overflow".into()))?;
    let transfer_id = state.transfer_id.clone();
    let mut progress = ProgressReporter::new(shared, &transfer_id, pending_bytes);

    for entry in manifest
        .entries
        .iter()
        .filter(|e| !skip.contains(e.path.as_str()))
    {
        let path = dest.staging_dir.join(safe_relative_path(&entry.path)?);
        let actual = receive_file(framed, &path, entry.size, compression, cancel, &mut progress, &entry.path).await?;
        if actual != entry.hash {
            let _ = tokio::fs::remove_file(&path).await;
            let _ = framed
                .send(&Completion::failed(format!("hash mismatch for {}", entry.path)))
                .await;
            let _ = framed.flush().await;
            return Err(ShareError::Integrity {
                path: entry.path.clone(),
                expected: entry.hash.clone(),
                actual,
            });
        }

        state.mark_completed(&entry.path, entry.size);
        shared.storage.save_transfer_state(&key, state)?;
        stats.files_transferred += 1;
        stats.bytes_transferred += entry.size;
        progress.emit(Some(&entry.path));
    }
    Ok(())
}

/// Receive exactly `size` bytes of one file into `path`, hashing as it goes.
async fn receive_file<S>(
    framed: &mut FramedStream<S>,
    path: &Path,
    size: u64,
    compression: CompressionMode,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<'_>,
    label: &str,
) -> ShareResult<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut remaining = size;

    match compression {
        CompressionMode::None => {
            let mut buf = vec![0u8; FILE_CHUNK_SIZE];
            while remaining > 0 {
                let n = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
                cancellable(cancel, framed.read_bytes_exact(&mut buf[..n])).await?;
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                remaining -= n as u64;
                progress.advance(n as u64, label);
            }
        }
        CompressionMode::Zstd => {
            let max_frame = max_compressed_frame();
            while remaining > 0 {
                let frame = cancellable(cancel, framed.read_frame(max_frame)).await?;
                let block = decompress_block(&frame)?;
                if block.is_empty() || block.len() as u64 > remaining {
                    return Err(ShareError::Protocol(format!(
                        "compressed block of {} bytes with {} remaining",
                        block.len(),
                        remaining
                    )));
                }
                hasher.update(&block);
                file.write_all(&block).await?;
                remaining -= block.len() as u64;
                progress.advance(block.len() as u64, label);
            }
        }
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// Move staged files into place and fingerprint the result. Blocking.
fn finalize(dest: &Destination, manifest: &Manifest, staged: &BTreeSet<String>) -> ShareResult<PackageHashes> {
    std::fs::create_dir_all(&dest.final_dir)?;
    for path in staged {
        let relative = safe_relative_path(path)?;
        let from = dest.staging_dir.join(&relative);
        let to = dest.final_dir.join(&relative);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if to.exists() {
            std::fs::remove_file(&to)?;
        }
        std::fs::rename(&from, &to)?;
    }
    clear_dir(&dest.staging_dir)?;

    if dest.mirror {
        prune_unlisted(&dest.final_dir, manifest)?;
    }
    PackageHashes::record(&dest.final_dir, manifest)
}

/// Remove files under `root` that `manifest` does not list.
fn prune_unlisted(root: &Path, manifest: &Manifest) -> ShareResult<()> {
    let index = manifest.index();
    let mut stale = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let wire = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if !index.contains_key(wire.as_str()) {
            stale.push(entry.path().to_path_buf());
        }
    }
    for path in stale {
        debug!(path = ?path, "Removing file absent from the incoming version");
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> ShareResult<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Staging must be creatable, writable and hold `needed` more bytes. Blocking.
fn ensure_capacity(staging: &Path, needed: u64) -> ShareResult<()> {
    std::fs::create_dir_all(staging).map_err(|e| {
        ShareError::Resource(format!("cannot create {}: {}", staging.display(), e))
    })?;

    let check = staging.join(WRITE_CHECK_FILE);
    std::fs::write(&check, b"")
        .and_then(|_| std::fs::remove_file(&check))
        .map_err(|e| ShareError::Resource(format!("{} is not writable: {}", staging.display(), e)))?;

    let available = fs2::available_space(staging)
        .map_err(|e| ShareError::Resource(format!("cannot query free space: {}", e)))?;
    if available < needed {
        return Err(ShareError::Resource(format!(
            "insufficient space: need {} bytes, {} available",
            needed, available
        )));
    }
    Ok(())
}

async fn serve_catalog<S>(shared: &Shared, framed: &mut FramedStream<S>) -> ShareResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _request: Manifest = framed.recv().await?;
    let dir = shared.config.library_dir.clone();
    let catalog = run_blocking(move || catalog::scan(&dir)).await?;
    framed.send(&catalog).await?;
    framed.flush().await
}

/// Read and discard speed test filler, then confirm.
async fn sink_speed_test<S>(
    shared: &Shared,
    framed: &mut FramedStream<S>,
    header: &TransferHeader,
) -> ShareResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if header.total_size > MAX_SPEED_TEST_BYTES {
        framed
            .send(&Completion::failed(format!(
                "speed test limited to {} bytes",
                MAX_SPEED_TEST_BYTES
            )))
            .await?;
        framed.flush().await?;
        return Err(ShareError::InvalidOperation(format!(
            "speed test of {} bytes refused",
            header.total_size
        )));
    }

    let mut buf = vec![0u8; FILE_CHUNK_SIZE];
    let mut remaining = header.total_size;
    let deadline = shared.config.handshake_timeout;
    while remaining > 0 {
        let n = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
        tokio::time::timeout(deadline, framed.read_bytes_exact(&mut buf[..n]))
            .await
            .map_err(|_| ShareError::Timeout("speed test stalled".into()))??;
        remaining -= n as u64;
    }
    framed.send(&Completion::ok()).await?;
    framed.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BindPolicy, ShareConfig};
    use crate::storage::Storage;
    use crate::transfer::manifest::ManifestEntry;
    use crate::transfer::TransferService;
    use tempfile::TempDir;

    fn service_in(root: &Path) -> (ShareConfig, TransferService) {
        let config = ShareConfig {
            device_id: "receiver".into(),
            transfer_port: 0,
            discovery_port: 0,
            bind: BindPolicy::Loopback,
            auto_accept: true,
            ..ShareConfig::with_root(root)
        };
        std::fs::create_dir_all(&config.data_dir).unwrap();
        let storage = Storage::new(config.database_path()).unwrap();
        let service = TransferService::new(&config, storage).unwrap();
        (config, service)
    }

    #[tokio::test]
    async fn test_hash_mismatch_aborts_without_landing() {
        let dir = TempDir::new().unwrap();
        let (config, service) = service_in(dir.path());
        let shared = service.shared.clone();

        let manifest = Manifest::from_entries(vec![ManifestEntry {
            path: "a.txt".into(),
            size: 2,
            hash: blake3::hash(b"hi").to_hex().to_string(),
        }]);
        let mut header = TransferHeader::new(TransferType::Package, "t-1", "rogue", "pack");
        header.total_files = manifest.total_files;
        header.total_size = manifest.total_bytes;

        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let receiving = tokio::spawn(async move {
            let mut framed = FramedStream::plain(ours);
            receive_package(&shared, &mut framed, peer, &header, None).await
        });

        let mut rogue = FramedStream::plain(theirs);
        rogue.send(&manifest).await.unwrap();
        rogue.flush().await.unwrap();
        let ack: Ack = rogue.recv().await.unwrap();
        assert!(ack.accepted);

        // Right length, wrong content
        rogue.write_bytes(b"ho").await.unwrap();
        rogue.flush().await.unwrap();
        let completion: Completion = rogue.recv().await.unwrap();
        assert!(!completion.success);
        assert!(completion.message.unwrap().contains("a.txt"));

        let err = receiving.await.unwrap().unwrap_err();
        match err {
            ShareError::Integrity { path, expected, actual } => {
                assert_eq!(path, "a.txt");
                assert_eq!(expected, blake3::hash(b"hi").to_hex().to_string());
                assert_eq!(actual, blake3::hash(b"ho").to_hex().to_string());
            }
            other => panic!("expected an integrity failure, got {other:?}"),
        }

        assert!(!config.receive_dir.join("pack").exists());
        let staged = Destination::in_receive_dir(&config.receive_dir, "pack").staging_dir;
        assert!(!staged.join("a.txt").exists());
    }
}
