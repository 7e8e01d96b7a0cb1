//! Application state management
//!
//! [`DeployRegistry`] is the in-process table of deployment identifiers. It
//! decides whether a dispatch may start (watcher-layer lock) and is what the
//! status server reports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use crate::deploy::fsm::DeployStage;
use crate::deploy::orchestrator::{Deployer, StageObserver};

/// Status of one identifier, keyed by container name.
#[derive(Debug, Clone, Serialize)]
pub struct DeployStatus {
    pub container: String,
    pub repo: Option<PathBuf>,
    pub active: bool,
    pub stage: DeployStage,
    /// Stage the last attempt failed in
    pub failed_stage: Option<DeployStage>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
    pub last_error: Option<String>,
}

impl DeployStatus {
    fn new(container: &str) -> Self {
        Self {
            container: container.to_string(),
            repo: None,
            active: false,
            stage: DeployStage::Idle,
            failed_stage: None,
            started_at: None,
            finished_at: None,
            last_outcome: None,
            last_error: None,
        }
    }
}

/// Per-identifier state table
#[derive(Default)]
pub struct DeployRegistry {
    entries: Mutex<HashMap<String, DeployStatus>>,
    released: Notify,
}

impl DeployRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `key` active. `None` when an attempt for `key` is already in
    /// flight; the caller drops its trigger.
    pub fn try_acquire(self: &Arc<Self>, key: &str, repo: Option<PathBuf>) -> Option<DeployGuard> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| DeployStatus::new(key));
        if entry.active {
            return None;
        }

        entry.active = true;
        entry.stage = DeployStage::Idle;
        entry.failed_stage = None;
        entry.started_at = Some(Utc::now());
        entry.finished_at = None;
        if repo.is_some() {
            entry.repo = repo;
        }

        Some(DeployGuard {
            registry: self.clone(),
            key: key.to_string(),
        })
    }

    /// Mark `key` active, waiting for a running attempt to finish first.
    pub async fn acquire(self: &Arc<Self>, key: &str, repo: Option<PathBuf>) -> DeployGuard {
        loop {
            let released = self.released.notified();
            if let Some(guard) = self.try_acquire(key, repo.clone()) {
                return guard;
            }
            released.await;
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).map(|e| e.active).unwrap_or(false)
    }

    pub fn get(&self, key: &str) -> Option<DeployStatus> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    /// All known identifiers, sorted by container name
    pub fn snapshot(&self) -> Vec<DeployStatus> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut statuses: Vec<DeployStatus> = entries.values().cloned().collect();
        statuses.sort_by(|a, b| a.container.cmp(&b.container));
        statuses
    }

    fn finish(&self, key: &str, outcome: &str, error: Option<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.last_outcome = Some(outcome.to_string());
            entry.last_error = error;
        }
    }

    fn release(&self, key: &str) {
        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get_mut(key) {
                entry.active = false;
                entry.finished_at = Some(Utc::now());
            }
        }
        self.released.notify_waiters();
    }
}

impl StageObserver for DeployRegistry {
    fn on_stage(&self, container: &str, stage: DeployStage) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(container.to_string())
            .or_insert_with(|| DeployStatus::new(container))
            .stage = stage;
    }

    fn on_failure(&self, container: &str, stage: DeployStage, error: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries
            .entry(container.to_string())
            .or_insert_with(|| DeployStatus::new(container));
        entry.failed_stage = Some(stage);
        entry.last_error = Some(error.to_string());
    }
}

/// Marks one identifier active until dropped.
pub struct DeployGuard {
    registry: Arc<DeployRegistry>,
    key: String,
}

impl DeployGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Record how the attempt ended.
    pub fn finish(&self, outcome: &str, error: Option<String>) {
        self.registry.finish(&self.key, outcome, error);
    }
}

impl Drop for DeployGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

impl std::fmt::Debug for DeployGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeployGuard").field("key", &self.key).finish()
    }
}

/// Main application state
pub struct AppState {
    /// Deploy state table
    pub registry: Arc<DeployRegistry>,

    /// Deploy pipeline
    pub deployer: Arc<Deployer>,
}
