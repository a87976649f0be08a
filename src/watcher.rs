//! Filesystem-change capability for segment discovery.
//!
//! The buffer consumes a `SegmentWatcher`, not a concrete backend. On Linux
//! the inotify-backed `notify` watcher reports close-write directly; on other
//! platforms a polling watcher synthesizes close-write once a file's size is
//! stable across two scans.

use notify::event::{AccessKind, AccessMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to create watcher: {0}")]
    Init(#[from] notify::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Created,
    ClosedWrite,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchKind,
}

/// One-shot directory watch: events flow on the returned channel until the
/// watcher value is dropped.
pub trait SegmentWatcher: Send {
    fn watch(&mut self, dir: &Path) -> Result<mpsc::Receiver<WatchEvent>, WatchError>;
}

/// Pick the watcher implementation for the current platform.
pub fn platform_watcher(poll_interval: Duration) -> Box<dyn SegmentWatcher> {
    if cfg!(target_os = "linux") {
        Box::new(NotifyWatcher::new())
    } else {
        Box::new(PollingWatcher::new(poll_interval))
    }
}

/// inotify-backed watcher. Close-write events map one-to-one.
pub struct NotifyWatcher {
    inner: Option<notify::RecommendedWatcher>,
}

impl NotifyWatcher {
    pub fn new() -> Self {
        Self { inner: None }
    }
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentWatcher for NotifyWatcher {
    fn watch(&mut self, dir: &Path) -> Result<mpsc::Receiver<WatchEvent>, WatchError> {
        let (tx, rx) = mpsc::channel(64);

        let mut watcher = notify::RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "watch backend error");
                        return;
                    }
                };

                let kind = match event.kind {
                    EventKind::Create(_) => WatchKind::Created,
                    EventKind::Access(AccessKind::Close(AccessMode::Write)) => {
                        WatchKind::ClosedWrite
                    }
                    _ => return,
                };

                for path in event.paths {
                    // Receiver gone means the buffer shut down; nothing to do.
                    let _ = tx.blocking_send(WatchEvent { path, kind });
                }
            },
            notify::Config::default(),
        )?;

        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        self.inner = Some(watcher);

        Ok(rx)
    }
}

/// Polling fallback for platforms without close-write notification.
///
/// A file counts as closed once its size is non-zero and unchanged between
/// two consecutive scans.
pub struct PollingWatcher {
    interval: Duration,
}

impl PollingWatcher {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl SegmentWatcher for PollingWatcher {
    fn watch(&mut self, dir: &Path) -> Result<mpsc::Receiver<WatchEvent>, WatchError> {
        let (tx, rx) = mpsc::channel(64);
        let dir = dir.to_path_buf();
        let interval = self.interval;

        tokio::spawn(async move {
            // filename -> size at last scan; None once reported
            let mut tracked: HashMap<PathBuf, Option<u64>> = HashMap::new();

            loop {
                tokio::time::sleep(interval).await;
                if tx.is_closed() {
                    break;
                }

                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        debug!(dir = %dir.display(), error = %e, "poll scan failed");
                        continue;
                    }
                };

                let mut present: Vec<PathBuf> = Vec::new();
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    let len = match entry.metadata().await {
                        Ok(meta) if meta.is_file() => meta.len(),
                        _ => continue,
                    };
                    present.push(path.clone());

                    match tracked.get(&path) {
                        Some(None) => {}
                        Some(Some(prev)) if *prev == len && len > 0 => {
                            tracked.insert(path.clone(), None);
                            if tx
                                .send(WatchEvent {
                                    path,
                                    kind: WatchKind::ClosedWrite,
                                })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        _ => {
                            tracked.insert(path, Some(len));
                        }
                    }
                }

                // Forget files deleted by retention so a recycled name after a
                // hard reset is reported again.
                tracked.retain(|path, _| present.contains(path));
            }
        });

        Ok(rx)
    }
}
