//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::{AppState, DeployRegistry};
use crate::deploy::orchestrator::Deployer;
use crate::deploy::proxy::ReverseProxy;
use crate::deploy::runtime::ContainerRuntime;
use crate::errors::AppError;
use crate::filesys::dir::Dir;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::watch::source::WatchSource;
use crate::workers::deployer::{self, Dispatcher, Job};
use crate::workers::watcher;

/// Run the watcher daemon until `shutdown_signal` resolves or the watcher
/// stops on its own.
pub async fn run(
    options: AppOptions,
    source: Arc<dyn WatchSource>,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<dyn ReverseProxy>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AppError> {
    info!("Initializing pfdeploy...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let mut watcher_handle = match init(
        &options,
        source,
        runtime,
        proxy,
        shutdown_tx.clone(),
        &mut shutdown_manager,
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start pfdeploy: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };

    let watcher_result = tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
            None
        }
        result = &mut watcher_handle => Some(result),
    };

    match watcher_result {
        None => shutdown_manager.with_watcher_handle(watcher_handle)?,
        Some(Ok(Ok(()))) => info!("Watcher stopped, shutting down..."),
        Some(Ok(Err(e))) => {
            error!("Watcher failed: {}", e);
            drop(shutdown_tx);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
        Some(Err(e)) => {
            error!("Watcher task failed: {}", e);
            drop(shutdown_tx);
            shutdown_manager.shutdown().await?;
            return Err(AppError::WatchError(e.to_string()));
        }
    }

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    source: Arc<dyn WatchSource>,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<dyn ReverseProxy>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<JoinHandle<Result<(), AppError>>, AppError> {
    let app_state = init_app_state(options, runtime, proxy).await?;

    let (dispatcher, rx) = deployer::channel(&options.workers, app_state.registry.clone());

    init_deployer_workers(
        options.workers.clone(),
        app_state.clone(),
        rx,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    if options.enable_status_server {
        init_status_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    init_watcher(
        options.watch.clone(),
        source,
        dispatcher,
        shutdown_tx.subscribe(),
    )
    .await
}

async fn init_app_state(
    options: &AppOptions,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<dyn ReverseProxy>,
) -> Result<Arc<AppState>, AppError> {
    Dir::new(&options.deploy.lock_dir).create().await?;

    let registry = Arc::new(DeployRegistry::new());
    let deployer = Deployer::new(runtime, proxy, options.deploy.clone())
        .with_observer(registry.clone());

    Ok(Arc::new(AppState {
        registry,
        deployer: Arc::new(deployer),
    }))
}

async fn init_deployer_workers(
    options: deployer::Options,
    app_state: Arc<AppState>,
    rx: tokio::sync::mpsc::Receiver<Job>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AppError> {
    info!("Initializing deployer workers...");

    let deployer = app_state.deployer.clone();

    let deployer_handle = tokio::spawn(async move {
        deployer::run(
            &options,
            deployer,
            rx,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_deployer_worker_handle(deployer_handle)?;
    Ok(())
}

async fn init_status_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AppError> {
    info!("Initializing status server...");

    let server_state = ServerState::new(
        app_state.registry.clone(),
        Dir::new(&options.deploy.sites_dir),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_status_server_handle(server_handle)?;
    Ok(())
}

async fn init_watcher(
    options: watcher::Options,
    source: Arc<dyn WatchSource>,
    dispatcher: Dispatcher,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<JoinHandle<Result<(), AppError>>, AppError> {
    info!("Initializing filesystem watcher...");

    Ok(tokio::spawn(async move {
        watcher::run(
            &options,
            source,
            dispatcher,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await
    }))
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    watcher_handle: Option<JoinHandle<Result<(), AppError>>>,
    deployer_worker_handle: Option<JoinHandle<()>>,
    status_server_handle: Option<JoinHandle<Result<(), AppError>>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            watcher_handle: None,
            deployer_worker_handle: None,
            status_server_handle: None,
        }
    }

    pub fn with_watcher_handle(
        &mut self,
        handle: JoinHandle<Result<(), AppError>>,
    ) -> Result<(), AppError> {
        if self.watcher_handle.is_some() {
            return Err(AppError::ShutdownError("watcher_handle already set".to_string()));
        }
        self.watcher_handle = Some(handle);
        Ok(())
    }

    pub fn with_deployer_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AppError> {
        if self.deployer_worker_handle.is_some() {
            return Err(AppError::ShutdownError("deployer_handle already set".to_string()));
        }
        self.deployer_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_status_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AppError>>,
    ) -> Result<(), AppError> {
        if self.status_server_handle.is_some() {
            return Err(AppError::ShutdownError("server_handle already set".to_string()));
        }
        self.status_server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AppError> {
        info!("Shutting down pfdeploy...");

        // 1. Watch streams
        if let Some(handle) = self.watcher_handle.take() {
            handle.await.map_err(|e| AppError::ShutdownError(e.to_string()))??;
        }

        // 2. Deployer workers, waiting for in-flight deploys
        if let Some(handle) = self.deployer_worker_handle.take() {
            handle.await.map_err(|e| AppError::ShutdownError(e.to_string()))?;
        }

        // 3. Status server
        if let Some(handle) = self.status_server_handle.take() {
            handle.await.map_err(|e| AppError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
