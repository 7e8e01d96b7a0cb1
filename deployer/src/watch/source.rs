//! Filesystem event sources

use std::any::Any;
use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::AppError;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// A sequence of filesystem events. Ends when the underlying subscription
/// is gone; open a new one from the source to restart.
pub struct WatchStream {
    rx: mpsc::Receiver<WatchEvent>,
    _handle: Option<Box<dyn Any + Send>>,
}

impl WatchStream {
    /// Stream fed by `rx`. `handle` is kept alive as long as the stream.
    pub fn from_channel(rx: mpsc::Receiver<WatchEvent>, handle: Option<Box<dyn Any + Send>>) -> Self {
        Self {
            rx,
            _handle: handle,
        }
    }

    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// Capability to subscribe to changes below a directory.
pub trait WatchSource: Send + Sync {
    /// Subscribe to `root`. Non-recursive subscriptions only report the
    /// direct children of `root`.
    fn open(&self, root: &Path, recursive: bool) -> Result<WatchStream, AppError>;
}

/// Watch source backed by the platform notifier (inotify on Linux).
#[derive(Debug, Default, Clone)]
pub struct NotifySource;

impl WatchSource for NotifySource {
    fn open(&self, root: &Path, recursive: bool) -> Result<WatchStream, AppError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for watch_event in translate(event) {
                        // Runs on the notifier thread, outside the runtime
                        if tx.blocking_send(watch_event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("Filesystem watch error: {}", e),
            })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(root, mode)?;
        debug!("Watching {} (recursive: {})", root.display(), recursive);

        Ok(WatchStream::from_channel(rx, Some(Box::new(watcher))))
    }
}

/// Map a notifier event onto watch events. A rename becomes a removal of the
/// old path and a creation of the new one.
pub fn translate(event: Event) -> Vec<WatchEvent> {
    let mut paths = event.paths.into_iter();
    match event.kind {
        EventKind::Create(_) => paths
            .map(|p| WatchEvent::new(p, WatchEventKind::Created))
            .collect(),
        EventKind::Remove(_) => paths
            .map(|p| WatchEvent::new(p, WatchEventKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => paths
                .map(|p| WatchEvent::new(p, WatchEventKind::Removed))
                .collect(),
            RenameMode::To => paths
                .map(|p| WatchEvent::new(p, WatchEventKind::Created))
                .collect(),
            RenameMode::Both => {
                let mut events = Vec::with_capacity(2);
                if let Some(from) = paths.next() {
                    events.push(WatchEvent::new(from, WatchEventKind::Removed));
                }
                if let Some(to) = paths.next() {
                    events.push(WatchEvent::new(to, WatchEventKind::Created));
                }
                events
            }
            _ => paths
                .map(|p| {
                    let kind = if p.exists() {
                        WatchEventKind::Created
                    } else {
                        WatchEventKind::Removed
                    };
                    WatchEvent::new(p, kind)
                })
                .collect(),
        },
        EventKind::Modify(_) => paths
            .map(|p| WatchEvent::new(p, WatchEventKind::Modified))
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}
