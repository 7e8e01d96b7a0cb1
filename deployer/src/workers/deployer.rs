//! Deploy worker pool
//!
//! Triggers from the watcher go through [`Dispatcher`] into a bounded queue
//! drained by a fixed number of workers. Each queued job carries the
//! registry guard of its identifier, so at most one attempt per identifier
//! is queued or running at any time.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::app::state::{DeployGuard, DeployRegistry};
use crate::deploy::cleanup::CleanupOutcome;
use crate::deploy::identifier::Identifier;
use crate::deploy::orchestrator::{DeployOutcome, DeployRequest, Deployer, SkipReason};

/// Deployer worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Number of concurrent workers
    pub workers: usize,

    /// Jobs that may wait in the queue
    pub queue_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug)]
pub enum Job {
    Deploy {
        request: DeployRequest,
        guard: DeployGuard,
    },
    Cleanup {
        name: String,
        guard: DeployGuard,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchResult {
    Queued,
    /// An attempt for the same identifier is queued or running.
    InFlight,
    InvalidName,
    QueueFull,
    Closed,
}

/// Producer side of the job queue.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
    registry: Arc<DeployRegistry>,
}

/// Create the job queue.
pub fn channel(options: &Options, registry: Arc<DeployRegistry>) -> (Dispatcher, mpsc::Receiver<Job>) {
    let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
    (Dispatcher { tx, registry }, rx)
}

impl Dispatcher {
    /// Queue a deploy of `repo_path`. The trigger is dropped when the same
    /// identifier is already in flight or the queue is full.
    pub fn dispatch_deploy(&self, repo_path: &Path, force: bool) -> DispatchResult {
        let identifier = match Identifier::from_path(repo_path) {
            Ok(identifier) => identifier,
            Err(e) => {
                warn!("Ignoring {}: {}", repo_path.display(), e);
                return DispatchResult::InvalidName;
            }
        };
        let key = identifier.container_name();

        let Some(guard) = self
            .registry
            .try_acquire(&key, Some(repo_path.to_path_buf()))
        else {
            info!("Deploy of {} already in flight, dropping trigger", key);
            return DispatchResult::InFlight;
        };

        let job = Job::Deploy {
            request: DeployRequest {
                repo_path: repo_path.to_path_buf(),
                force,
            },
            guard,
        };
        match self.tx.try_send(job) {
            Ok(()) => {
                debug!("Queued deploy of {} (force: {})", key, force);
                DispatchResult::Queued
            }
            Err(TrySendError::Full(_)) => {
                warn!("Deploy queue is full, dropping trigger for {}", key);
                DispatchResult::QueueFull
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Deploy queue is closed, dropping trigger for {}", key);
                DispatchResult::Closed
            }
        }
    }

    /// Queue a cleanup of directory `name`. Waits in the background for a
    /// running attempt of the same identifier instead of dropping the
    /// trigger.
    pub fn dispatch_cleanup(&self, name: &str) -> DispatchResult {
        let identifier = match Identifier::parse(name) {
            Ok(identifier) => identifier,
            Err(e) => {
                warn!("Ignoring removal of {}: {}", name, e);
                return DispatchResult::InvalidName;
            }
        };
        if self.tx.is_closed() {
            return DispatchResult::Closed;
        }

        let key = identifier.container_name();
        let name = name.to_string();
        let registry = self.registry.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if registry.is_active(&key) {
                info!("Cleanup of {} waits for the running deploy", key);
            }
            let guard = registry.acquire(&key, None).await;
            if tx.send(Job::Cleanup { name, guard }).await.is_err() {
                warn!("Deploy queue is closed, dropping cleanup of {}", key);
            } else {
                debug!("Queued cleanup of {}", key);
            }
        });
        DispatchResult::Queued
    }
}

/// Run the worker pool until `shutdown_signal` resolves or every
/// dispatcher is gone. Jobs already taken by a worker run to completion.
pub async fn run(
    options: &Options,
    deployer: Arc<Deployer>,
    rx: mpsc::Receiver<Job>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    let worker_count = options.workers.max(1);
    info!("Deployer workers starting ({})", worker_count);

    let rx = Arc::new(Mutex::new(rx));
    let (stop_tx, _) = broadcast::channel::<()>(1);

    let handles = (0..worker_count)
        .map(|id| {
            let stop_rx = stop_tx.subscribe();
            tokio::spawn(worker_loop(id, rx.clone(), deployer.clone(), stop_rx))
        })
        .collect::<Vec<_>>();
    let workers = futures::future::join_all(handles);
    tokio::pin!(workers);

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Deployer workers shutting down...");
            let _ = stop_tx.send(());
        }
        _ = &mut workers => {
            info!("Deploy queue closed, workers stopped");
            return;
        }
    }

    for result in workers.await {
        if let Err(e) = result {
            error!("Deploy worker panicked: {}", e);
        }
    }
    info!("Deployer workers stopped");
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    deployer: Arc<Deployer>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = stop_rx.recv() => None,
            job = async { rx.lock().await.recv().await } => job,
        };
        let Some(job) = job else {
            debug!("Deploy worker {} exiting", id);
            return;
        };
        handle_job(&deployer, job).await;
    }
}

/// Execute one job and record its outcome on the guard.
pub async fn handle_job(deployer: &Deployer, job: Job) {
    match job {
        Job::Deploy { request, guard } => match deployer.deploy(&request).await {
            Ok(DeployOutcome::Deployed(_)) => guard.finish("deployed", None),
            Ok(DeployOutcome::Skipped(reason)) => guard.finish(skip_label(reason), None),
            Err(e) => {
                error!(
                    "Deploy of {} from {} failed ({}): {}",
                    guard.key(),
                    request.repo_path.display(),
                    e.stage(),
                    e
                );
                guard.finish("failed", Some(e.to_string()));
            }
        },
        Job::Cleanup { name, guard } => match deployer.cleanup(&name).await {
            Ok(CleanupOutcome::Removed { .. }) => guard.finish("removed", None),
            Ok(CleanupOutcome::Skipped { reason }) => guard.finish("skipped", Some(reason)),
            Err(e) => {
                error!("Cleanup of {} ({}) failed: {}", name, guard.key(), e);
                guard.finish("cleanup_failed", Some(e.to_string()));
            }
        },
    }
}

fn skip_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::AlreadyRunning => "skipped_already_running",
        SkipReason::LockHeld => "skipped_lock_held",
    }
}
