//! Debounced filesystem watcher for a monitored save directory
//!
//! notify delivers events on its own thread; the callback only forwards a
//! tick into a tokio channel. A debounce task restarts its quiet-period timer
//! on every tick and fires once the directory has been quiet long enough.

use std::path::Path;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ShareError, ShareResult};

/// Watches one save directory until dropped
pub struct SaveWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for SaveWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveWatcher").finish_non_exhaustive()
    }
}

impl SaveWatcher {
    /// Watch `path` recursively. After `quiet` without further changes,
    /// `save_id` is sent on `trigger`.
    pub fn start(
        save_id: &str,
        path: &Path,
        quiet: Duration,
        trigger: mpsc::UnboundedSender<String>,
    ) -> ShareResult<Self> {
        let (tick_tx, tick_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                Ok(_) => {
                    let _ = tick_tx.send(());
                }
                Err(e) => warn!(error = %e, "Watcher error"),
            }
        })
        .map_err(|e| ShareError::InvalidOperation(format!("failed to create file watcher: {}", e)))?;

        watcher
            .watch(path, RecursiveMode::Recursive)
            .map_err(|e| {
                ShareError::InvalidOperation(format!("failed to watch {}: {}", path.display(), e))
            })?;

        info!(save_id, path = ?path, quiet = ?quiet, "Watching save directory");
        let task = tokio::spawn(debounce(tick_rx, quiet, save_id.to_string(), trigger));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for SaveWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Fire `save_id` on `trigger` once `quiet` has passed since the last tick.
pub(crate) async fn debounce(
    mut ticks: mpsc::UnboundedReceiver<()>,
    quiet: Duration,
    save_id: String,
    trigger: mpsc::UnboundedSender<String>,
) {
    let mut deadline: Option<Instant> = None;
    loop {
        let fire_at = deadline;
        tokio::select! {
            tick = ticks.recv() => match tick {
                Some(()) => deadline = Some(Instant::now() + quiet),
                None => return,
            },
            _ = async move {
                match fire_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                deadline = None;
                debug!(%save_id, "Save directory quiet, scheduling sync");
                if trigger.send(save_id.clone()).is_err() {
                    return;
                }
            }
        }
    }
}
