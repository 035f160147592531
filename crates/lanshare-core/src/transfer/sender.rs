//! Outgoing flows: package send, catalog request, speed test, save serving

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::events::{Direction, SpeedTestResult, TransferEvent, TransferInfo, TransferResult, TransferStats};
use super::manifest::{safe_item_name, safe_relative_path, total_size, Manifest, ManifestEntry};
use super::protocol::{
    compress_block, Ack, Completion, LibraryCatalog, TransferHeader, TransferType, FILE_CHUNK_SIZE,
    MAX_SPEED_TEST_BYTES, ZSTD_BLOCK_SIZE,
};
use super::run_blocking;
use super::service::{ProgressReporter, Shared};
use crate::config::CompressionMode;
use crate::error::{ShareError, ShareResult};
use crate::net::{cancellable, FramedStream};

/// Slack on top of the receiver's approval window while waiting for its ack
const ACK_GRACE: Duration = Duration::from_secs(10);

/// Send `source` as package `item_name` and wait for the receiver's verdict.
pub(crate) async fn send_package<S>(
    shared: &Arc<Shared>,
    framed: &mut FramedStream<S>,
    peer: SocketAddr,
    transfer_id: &str,
    item_name: &str,
    source: &Path,
) -> ShareResult<TransferResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    safe_item_name(item_name)?;
    let manifest = build_manifest(shared, source).await?;
    let compression = shared.config.compression;

    let mut header = TransferHeader::new(
        TransferType::Package,
        transfer_id,
        shared.config.device_id.clone(),
        item_name,
    );
    header.total_files = manifest.total_files;
    header.total_size = manifest.total_bytes;
    header.compression = compression;

    let guard = shared.register(TransferInfo {
        transfer_id: transfer_id.to_string(),
        direction: Direction::Send,
        peer,
        item_name: item_name.to_string(),
        total_bytes: manifest.total_bytes,
        started_at: Utc::now(),
    });
    let cancel = &guard.cancel;
    let started = Instant::now();

    framed.send(&header).await?;
    framed.send(&manifest).await?;
    framed.flush().await?;

    let ack_wait = shared.config.approval_timeout + ACK_GRACE;
    let ack: Ack = cancellable(cancel, async {
        tokio::time::timeout(ack_wait, framed.recv::<Ack>())
            .await
            .map_err(|_| ShareError::Timeout("waiting for the receiver's answer".into()))?
    })
    .await?;
    if !ack.accepted {
        let reason = ack.reason.unwrap_or_else(|| "declined by receiver".into());
        info!(%peer, item = item_name, %reason, "Transfer declined");
        return Err(ShareError::Declined(reason));
    }

    let skipped: HashSet<&str> = ack.skipped_files.iter().map(String::as_str).collect();
    let pending: Vec<&ManifestEntry> = manifest
        .entries
        .iter()
        .filter(|e| !skipped.contains(e.path.as_str()))
        .collect();
    let pending_bytes = total_size(pending.iter().copied()).unwrap_or(u64::MAX);
    debug!(
        %transfer_id,
        sending = pending.len(),
        skipped = manifest.entries.len() - pending.len(),
        "Receiver accepted"
    );

    let mut progress = ProgressReporter::new(shared, transfer_id, pending_bytes);
    let mut stats = TransferStats {
        files_skipped: (manifest.entries.len() - pending.len()) as u64,
        ..Default::default()
    };
    for entry in pending {
        let path = source_path(source, &manifest, entry)?;
        send_file(shared, framed, &path, entry, compression, cancel, &mut progress).await?;
        stats.files_transferred += 1;
        stats.bytes_transferred += entry.size;
        progress.emit(Some(&entry.path));
    }
    framed.flush().await?;

    let completion: Completion = cancellable(cancel, framed.recv()).await?;
    if !completion.success {
        return Err(ShareError::Transport(format!(
            "receiver reported failure: {}",
            completion.message.unwrap_or_default()
        )));
    }

    stats.wire_bytes = framed.bytes_written();
    stats.elapsed = started.elapsed();
    info!(
        %transfer_id,
        files = stats.files_transferred,
        skipped = stats.files_skipped,
        bytes = stats.bytes_transferred,
        "Package sent"
    );
    shared.emit(TransferEvent::Completed {
        transfer_id: transfer_id.to_string(),
        direction: Direction::Send,
        stats: stats.clone(),
    });
    Ok(TransferResult::succeeded(transfer_id, ack.skipped_files, stats))
}

/// Build the manifest on a blocking thread, reusing and refreshing the
/// cached hashes for `source`.
async fn build_manifest(shared: &Shared, source: &Path) -> ShareResult<Manifest> {
    let cached = shared.storage.load_package_hashes(source)?;
    let root = source.to_path_buf();
    let (manifest, hashes) = run_blocking(move || Manifest::build(&root, cached.as_ref())).await?;
    shared.storage.save_package_hashes(source, &hashes)?;
    Ok(manifest)
}

/// A single-file package names the file itself.
fn source_path(source: &Path, manifest: &Manifest, entry: &ManifestEntry) -> ShareResult<std::path::PathBuf> {
    if source.is_file() && manifest.entries.len() == 1 {
        return Ok(source.to_path_buf());
    }
    Ok(source.join(safe_relative_path(&entry.path)?))
}

/// Stream exactly `entry.size` bytes of one file.
async fn send_file<S>(
    shared: &Shared,
    framed: &mut FramedStream<S>,
    path: &Path,
    entry: &ManifestEntry,
    compression: CompressionMode,
    cancel: &CancellationToken,
    progress: &mut ProgressReporter<'_>,
) -> ShareResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut file = tokio::fs::File::open(path).await?;
    let mut remaining = entry.size;

    match compression {
        CompressionMode::None => {
            let mut buf = vec![0u8; FILE_CHUNK_SIZE];
            while remaining > 0 {
                let n = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
                file.read_exact(&mut buf[..n]).await?;
                cancellable(cancel, async {
                    shared.limiter.acquire(n).await;
                    framed.write_bytes(&buf[..n]).await
                })
                .await?;
                remaining -= n as u64;
                progress.advance(n as u64, &entry.path);
            }
        }
        CompressionMode::Zstd => {
            let mut buf = vec![0u8; ZSTD_BLOCK_SIZE];
            while remaining > 0 {
                let n = remaining.min(ZSTD_BLOCK_SIZE as u64) as usize;
                file.read_exact(&mut buf[..n]).await?;
                let block = buf[..n].to_vec();
                let compressed = run_blocking(move || compress_block(&block)).await?;
                cancellable(cancel, async {
                    shared.limiter.acquire(compressed.len()).await;
                    framed.write_frame(&compressed).await
                })
                .await?;
                remaining -= n as u64;
                progress.advance(n as u64, &entry.path);
            }
        }
    }
    Ok(())
}

/// Ask the peer for its library catalog.
pub(crate) async fn request_catalog<S>(
    shared: &Shared,
    framed: &mut FramedStream<S>,
) -> ShareResult<LibraryCatalog>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header = TransferHeader::new(
        TransferType::ListRequest,
        ulid::Ulid::new().to_string(),
        shared.config.device_id.clone(),
        "",
    );
    framed.send(&header).await?;
    framed.send(&Manifest::default()).await?;
    framed.flush().await?;

    tokio::time::timeout(shared.config.handshake_timeout, framed.recv())
        .await
        .map_err(|_| ShareError::Timeout("waiting for library catalog".into()))?
}

/// Push `bytes` of filler through the limiter and time the round trip.
pub(crate) async fn run_speed_test<S>(
    shared: &Shared,
    framed: &mut FramedStream<S>,
    transfer_id: &str,
    bytes: u64,
    cancel: &CancellationToken,
) -> ShareResult<SpeedTestResult>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if bytes > MAX_SPEED_TEST_BYTES {
        return Err(ShareError::InvalidOperation(format!(
            "speed test of {} bytes exceeds the {} byte limit",
            bytes, MAX_SPEED_TEST_BYTES
        )));
    }

    let mut header = TransferHeader::new(
        TransferType::SpeedTest,
        transfer_id,
        shared.config.device_id.clone(),
        "speed-test",
    );
    header.total_size = bytes;
    framed.send(&header).await?;

    let filler = vec![0u8; FILE_CHUNK_SIZE];
    let mut progress = ProgressReporter::new(shared, transfer_id, bytes);
    let started = Instant::now();
    let mut remaining = bytes;
    while remaining > 0 {
        let n = remaining.min(FILE_CHUNK_SIZE as u64) as usize;
        cancellable(cancel, async {
            shared.limiter.acquire(n).await;
            framed.write_bytes(&filler[..n]).await
        })
        .await?;
        remaining -= n as u64;
        progress.advance(n as u64, "speed-test");
    }
    framed.flush().await?;

    let completion: Completion = cancellable(cancel, framed.recv()).await?;
    let elapsed = started.elapsed();
    if !completion.success {
        return Err(ShareError::Transport(format!(
            "speed test rejected: {}",
            completion.message.unwrap_or_default()
        )));
    }

    shared.emit(TransferEvent::Completed {
        transfer_id: transfer_id.to_string(),
        direction: Direction::Send,
        stats: TransferStats {
            bytes_transferred: bytes,
            wire_bytes: framed.bytes_written(),
            elapsed,
            ..Default::default()
        },
    });
    Ok(SpeedTestResult { bytes, elapsed })
}

/// Answer a `SaveRequest`: decline unknown saves, otherwise send the save
/// directory as a package on this connection.
pub(crate) async fn serve_save_request<S>(
    shared: &Arc<Shared>,
    framed: &mut FramedStream<S>,
    peer: SocketAddr,
    header: &TransferHeader,
) -> ShareResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let save_id = header.item_name.as_str();
    let Some(dir) = shared.save_dir(save_id) else {
        framed.send(&Ack::decline(format!("unknown save {}", save_id))).await?;
        framed.flush().await?;
        return Err(ShareError::NotFound(format!("save {}", save_id)));
    };

    framed.send(&Ack::accept(Vec::new())).await?;
    info!(%peer, save_id, "Serving save contents");
    send_package(shared, framed, peer, &header.transfer_id, save_id, &dir).await?;
    Ok(())
}
