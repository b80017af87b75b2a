//! Waiting for a rotated-away file to reappear at its original path.
//!
//! Existence is polled with an exponential backoff. A `notify` watch on the
//! parent directory wakes the wait early when something is created or
//! renamed into place. Writes landing between the rename and the re-open
//! are not seen as individual events; they are recovered by the full
//! re-read the session performs once the file is back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounds of the existence poll while a file is away.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RecreationBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for RecreationBackoff {
    fn default() -> Self {
        RecreationBackoff {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(10),
        }
    }
}

impl RecreationBackoff {
    fn next(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max)
    }
}

/// How a recreation wait ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Recreation {
    Reappeared,
    Cancelled,
}

/// Waits until `path` exists again, or until `cancel` fires.
pub async fn await_recreation(
    path: &Path,
    backoff: RecreationBackoff,
    cancel: &CancellationToken,
) -> Recreation {
    let (wake_tx, mut wake_rx) = mpsc::channel(1);
    // Keep the watcher alive for the duration of the wait.
    let _watcher = parent_watcher(path, wake_tx);

    let mut delay = backoff.initial;
    loop {
        if tokio::fs::metadata(path).await.is_ok() {
            return Recreation::Reappeared;
        }

        debug!(path = %path.display(), ?delay, "file not yet reappeared");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Recreation::Cancelled,
            Some(()) = wake_rx.recv() => {}
            _ = tokio::time::sleep(delay) => {
                delay = backoff.next(delay);
            }
        }
    }
}

/// Watches the directory holding `path` for entries that could be the file
/// coming back. Returns `None` (polling only) if the watch can't be set up.
fn parent_watcher(path: &Path, wake_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let name = path.file_name()?.to_os_string();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(event) => event,
            Err(_) => return,
        };
        let arrived = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_))
        );
        if arrived && event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str())) {
            // A wake is already pending if the channel is full.
            let _ = wake_tx.try_send(());
        }
    })
    .map_err(|e| warn!(error = %e, "failed to start directory watcher, polling only"))
    .ok()?;

    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .map_err(|e| {
            warn!(
                directory = %parent.display(),
                error = %e,
                "failed to watch directory, polling only"
            )
        })
        .ok()?;

    Some(watcher)
}
