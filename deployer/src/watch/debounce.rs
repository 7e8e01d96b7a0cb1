//! Per-path debounce

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

struct Pending {
    deadline: Instant,
    task: AbortHandle,
}

type PendingMap = Arc<Mutex<HashMap<PathBuf, Pending>>>;

/// Trailing debounce per path: the action for a key runs once `delay` has
/// passed without a new event for that key. Pending actions are aborted
/// when the debouncer is dropped.
pub struct Debouncer {
    delay: Duration,
    pending: PendingMap,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule `action` for `key`. When an action for `key` is already
    /// pending its timer restarts, the pending action is kept and false is
    /// returned.
    pub fn schedule<F, Fut>(&self, key: PathBuf, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + self.delay;
        if let Some(entry) = pending.get_mut(&key) {
            entry.deadline = deadline;
            return false;
        }

        let registry = self.pending.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let mut wake = deadline;
            loop {
                tokio::time::sleep_until(wake).await;
                match next_deadline(&registry, &task_key, wake) {
                    Some(later) => wake = later,
                    None => break,
                }
            }
            action().await;
        });
        pending.insert(
            key,
            Pending {
                deadline,
                task: task.abort_handle(),
            },
        );
        true
    }

    /// Restart the timer of a pending action. False when nothing is pending
    /// for `key`.
    pub fn touch(&self, key: &Path) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get_mut(key) {
            Some(entry) => {
                entry.deadline = Instant::now() + self.delay;
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, key: &Path) -> bool {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// The extended deadline of `key` if it moved past `wake`, otherwise
/// removes the entry so the action can run.
fn next_deadline(registry: &PendingMap, key: &Path, wake: Instant) -> Option<Instant> {
    let mut pending = registry.lock().unwrap_or_else(|e| e.into_inner());
    match pending.get(key) {
        Some(entry) if entry.deadline > wake => Some(entry.deadline),
        _ => {
            pending.remove(key);
            None
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in pending.drain() {
            entry.task.abort();
        }
    }
}
