//! Watcher and worker pool tests

#[path = "support.rs"]
mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use pfdeploy::app::options::AppOptions;
use pfdeploy::app::run::run;
use pfdeploy::app::state::DeployRegistry;
use pfdeploy::errors::AppError;
use pfdeploy::watch::source::{WatchEvent, WatchEventKind};
use pfdeploy::workers::deployer::{self, DispatchResult, Job};
use pfdeploy::workers::watcher;
use support::{descriptor, wait_until, ChannelSource, TestEnv};

struct Daemon {
    source: Arc<ChannelSource>,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), AppError>>,
}

impl Daemon {
    async fn start(env: &TestEnv) -> Self {
        Self::start_with(env, Duration::from_millis(50), Duration::from_millis(50)).await
    }

    async fn start_with(env: &TestEnv, settle_delay: Duration, change_debounce: Duration) -> Self {
        let options = AppOptions {
            watch: watcher::Options {
                root: env.root.clone(),
                settle_delay,
                change_debounce,
                ..Default::default()
            },
            deploy: env.options(),
            workers: deployer::Options {
                workers: 2,
                queue_capacity: 16,
            },
            enable_status_server: false,
            ..Default::default()
        };

        let source = ChannelSource::new();
        let (stop, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(run(
            options,
            source.clone(),
            env.runtime.clone(),
            env.proxy.clone(),
            async move {
                let _ = stop_rx.await;
            },
        ));

        let probe = source.clone();
        wait_until("the watch streams to open", || probe.subscriber_count() == 3).await;
        Self {
            source,
            stop,
            handle,
        }
    }

    fn emit(&self, path: std::path::PathBuf, kind: WatchEventKind) {
        self.source.emit(WatchEvent::new(path, kind));
    }

    async fn stop(self) -> Result<(), AppError> {
        let _ = self.stop.send(());
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .unwrap()
            .unwrap()
    }
}

// ==================================== WATCHER ===================================== //

#[tokio::test]
async fn test_catch_up_deploys_existing_repositories() {
    let env = TestEnv::new();
    env.create_repo("d_1_dataset1", Some(&descriptor(3000)));
    env.create_repo("d_1_dataset2_api", Some(&descriptor(3001)));
    env.create_repo("d_1_dataset3", None);
    env.create_repo("bad-name", Some(&descriptor(3002)));

    let daemon = Daemon::start(&env).await;
    let runtime = env.runtime.clone();
    wait_until("both repositories to run", || {
        runtime.is_running("app_d1_dataset1") && runtime.is_running("app_d1_dataset2")
    })
    .await;

    daemon.stop().await.unwrap();
    assert_eq!(env.runtime.build_count(), 2);
    assert_eq!(env.site_files().len(), 2);
}

#[tokio::test]
async fn test_new_directory_is_deployed() {
    let env = TestEnv::new();
    let daemon = Daemon::start(&env).await;

    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    daemon.emit(repo.clone(), WatchEventKind::Created);
    // Events from inside the new directory do not start a second deploy
    daemon.emit(repo.join("src"), WatchEventKind::Created);

    let runtime = env.runtime.clone();
    wait_until("the new repository to run", || runtime.is_running("app_d42_dataset7")).await;
    let site = env.site_file("42", "7");
    wait_until("the site file", || site.exists()).await;

    daemon.stop().await.unwrap();
    assert_eq!(env.runtime.build_count(), 1);
}

#[tokio::test]
async fn test_descriptor_of_new_directory_waits_for_settle() {
    let env = TestEnv::new();
    let daemon =
        Daemon::start_with(&env, Duration::from_millis(600), Duration::from_millis(50)).await;

    // A checkout lands: the directory and its descriptor first, sources later
    let repo = env.root.join("d_42_dataset7");
    std::fs::create_dir_all(&repo).unwrap();
    std::fs::write(repo.join("Dockerfile.pf"), descriptor(3000)).unwrap();
    daemon.emit(repo.clone(), WatchEventKind::Created);
    daemon.emit(repo.join("Dockerfile.pf"), WatchEventKind::Created);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(env.runtime.builds_started.load(Ordering::SeqCst), 0);

    std::fs::create_dir_all(repo.join("src")).unwrap();
    std::fs::write(repo.join("src").join("app.py"), "print('hello')\n").unwrap();
    daemon.emit(repo.join("src"), WatchEventKind::Created);
    daemon.emit(repo.join("src").join("app.py"), WatchEventKind::Created);

    // The late files restarted the settle delay
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(env.runtime.builds_started.load(Ordering::SeqCst), 0);

    let runtime = env.runtime.clone();
    wait_until("the settled repository to run", || runtime.is_running("app_d42_dataset7")).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    daemon.stop().await.unwrap();
    assert_eq!(env.runtime.build_count(), 1);
}

#[tokio::test]
async fn test_directory_gone_before_settling_is_ignored() {
    let env = TestEnv::new();
    let daemon = Daemon::start(&env).await;

    daemon.emit(env.root.join("d_42_dataset7"), WatchEventKind::Created);
    tokio::time::sleep(Duration::from_millis(300)).await;

    daemon.stop().await.unwrap();
    assert_eq!(env.runtime.builds_started.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_removed_directory_is_cleaned_up() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let daemon = Daemon::start(&env).await;

    let runtime = env.runtime.clone();
    wait_until("the catch-up deploy", || runtime.is_running("app_d42_dataset7")).await;

    std::fs::remove_dir_all(&repo).unwrap();
    daemon.emit(repo.clone(), WatchEventKind::Removed);

    let sites = env.sites.clone();
    wait_until("the teardown", || {
        runtime.container_count() == 0
            && std::fs::read_dir(&sites).map(|d| d.count() == 0).unwrap_or(false)
    })
    .await;

    daemon.stop().await.unwrap();
    assert!(!env.runtime.has_image("app_d42_dataset7:latest"));
}

#[tokio::test]
async fn test_descriptor_change_forces_redeploy() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let daemon = Daemon::start(&env).await;

    let runtime = env.runtime.clone();
    wait_until("the catch-up deploy", || runtime.is_running("app_d42_dataset7")).await;
    let site = env.site_file("42", "7");
    wait_until("the site file", || site.exists()).await;
    // Let the first attempt release its identifier
    tokio::time::sleep(Duration::from_millis(200)).await;
    let first = env.runtime.container("app_d42_dataset7").unwrap().generation;

    std::fs::write(repo.join("Dockerfile.pf"), descriptor(4000)).unwrap();
    for _ in 0..3 {
        daemon.emit(repo.join("Dockerfile.pf"), WatchEventKind::Modified);
    }

    wait_until("the redeploy", || {
        runtime
            .container("app_d42_dataset7")
            .map(|c| c.running && c.generation > first)
            .unwrap_or(false)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    daemon.stop().await.unwrap();
    assert_eq!(env.runtime.build_count(), 2);
    let site = std::fs::read_to_string(env.site_file("42", "7")).unwrap();
    assert!(site.contains("proxy_pass http://app_d42_dataset7:4000;"));
}

#[tokio::test]
async fn test_other_changes_do_not_redeploy() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let daemon = Daemon::start(&env).await;

    let runtime = env.runtime.clone();
    wait_until("the catch-up deploy", || runtime.is_running("app_d42_dataset7")).await;

    daemon.emit(repo.join("src").join("app.py"), WatchEventKind::Modified);
    daemon.emit(repo.join("node_modules").join("Dockerfile.pf"), WatchEventKind::Modified);
    daemon.emit(repo.join(".git").join("index"), WatchEventKind::Modified);
    daemon.emit(repo.join(".Dockerfile.pf.swp"), WatchEventKind::Created);
    daemon.emit(repo.join("4913"), WatchEventKind::Created);
    daemon.emit(repo.join("Dockerfile.pf"), WatchEventKind::Removed);
    tokio::time::sleep(Duration::from_millis(300)).await;

    daemon.stop().await.unwrap();
    assert_eq!(env.runtime.build_count(), 1);
}

#[tokio::test]
async fn test_stream_end_stops_watcher() {
    let env = TestEnv::new();
    let daemon = Daemon::start(&env).await;

    daemon.source.close();
    let result = tokio::time::timeout(Duration::from_secs(10), daemon.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AppError::WatchError(_))));
}

#[tokio::test]
async fn test_missing_root_fails() {
    let env = TestEnv::new();
    std::fs::remove_dir_all(&env.root).unwrap();

    let options = AppOptions {
        watch: watcher::Options {
            root: env.root.clone(),
            ..Default::default()
        },
        deploy: env.options(),
        enable_status_server: false,
        ..Default::default()
    };
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        run(
            options,
            ChannelSource::new(),
            env.runtime.clone(),
            env.proxy.clone(),
            std::future::pending::<()>(),
        ),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(AppError::WatchError(_))));
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_deploy() {
    let env = TestEnv::new();
    env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let gate = env.runtime.gate_builds();
    let daemon = Daemon::start(&env).await;

    let runtime = env.runtime.clone();
    wait_until("the build to start", || {
        runtime.builds_started.load(Ordering::SeqCst) == 1
    })
    .await;

    let _ = daemon.stop.send(());
    let mut handle = daemon.handle;
    assert!(tokio::time::timeout(Duration::from_millis(200), &mut handle)
        .await
        .is_err());

    gate.add_permits(1);
    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(env.runtime.is_running("app_d42_dataset7"));
}

// =================================== DISPATCHER ==================================== //

#[tokio::test]
async fn test_dispatch_drops_trigger_while_in_flight() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let registry = Arc::new(DeployRegistry::new());
    let (dispatcher, mut rx) = deployer::channel(&deployer::Options::default(), registry.clone());

    assert_eq!(dispatcher.dispatch_deploy(&repo, false), DispatchResult::Queued);
    assert_eq!(dispatcher.dispatch_deploy(&repo, true), DispatchResult::InFlight);
    assert!(registry.is_active("app_d42_dataset7"));

    // Same identifier through a different label
    let labelled = env.create_repo("d_42_dataset7_web", Some(&descriptor(3000)));
    assert_eq!(dispatcher.dispatch_deploy(&labelled, false), DispatchResult::InFlight);

    let bad = env.create_repo("bad-name", Some(&descriptor(3000)));
    assert_eq!(dispatcher.dispatch_deploy(&bad, false), DispatchResult::InvalidName);

    let job = rx.try_recv().unwrap();
    assert!(matches!(job, Job::Deploy { ref request, .. } if !request.force));
    assert!(rx.try_recv().is_err());

    drop(job);
    assert!(!registry.is_active("app_d42_dataset7"));
    assert_eq!(dispatcher.dispatch_deploy(&repo, true), DispatchResult::Queued);
}

#[tokio::test]
async fn test_full_queue_drops_trigger() {
    let env = TestEnv::new();
    let a = env.create_repo("d_1_dataset1", Some(&descriptor(3000)));
    let b = env.create_repo("d_1_dataset2", Some(&descriptor(3000)));
    let registry = Arc::new(DeployRegistry::new());
    let options = deployer::Options {
        workers: 1,
        queue_capacity: 1,
    };
    let (dispatcher, _rx) = deployer::channel(&options, registry.clone());

    assert_eq!(dispatcher.dispatch_deploy(&a, false), DispatchResult::Queued);
    assert_eq!(dispatcher.dispatch_deploy(&b, false), DispatchResult::QueueFull);
    assert!(!registry.is_active("app_d1_dataset2"));
}

#[tokio::test]
async fn test_cleanup_waits_for_running_deploy() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let registry = Arc::new(DeployRegistry::new());
    let (dispatcher, mut rx) = deployer::channel(&deployer::Options::default(), registry.clone());

    assert_eq!(dispatcher.dispatch_deploy(&repo, false), DispatchResult::Queued);
    assert_eq!(dispatcher.dispatch_cleanup("d_42_dataset7"), DispatchResult::Queued);
    assert_eq!(dispatcher.dispatch_cleanup("bad-name"), DispatchResult::InvalidName);

    let deploy_job = rx.recv().await.unwrap();
    assert!(matches!(deploy_job, Job::Deploy { .. }));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());

    drop(deploy_job);
    let cleanup_job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(cleanup_job, Job::Cleanup { ref name, .. } if name == "d_42_dataset7"));
    assert!(registry.is_active("app_d42_dataset7"));
}

#[tokio::test]
async fn test_workers_record_outcomes() {
    let env = TestEnv::new();
    let good = env.create_repo("d_1_dataset1", Some(&descriptor(3000)));
    let missing = env.create_repo("d_1_dataset2", None);
    let registry = Arc::new(DeployRegistry::new());
    let pipeline = Arc::new(env.deployer().with_observer(registry.clone()));
    let (dispatcher, rx) = deployer::channel(&deployer::Options::default(), registry.clone());

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let workers = tokio::spawn(async move {
        deployer::run(
            &deployer::Options::default(),
            pipeline,
            rx,
            Box::pin(async move {
                let _ = stop_rx.await;
            }),
        )
        .await;
    });

    assert_eq!(dispatcher.dispatch_deploy(&good, false), DispatchResult::Queued);
    assert_eq!(dispatcher.dispatch_deploy(&missing, false), DispatchResult::Queued);

    let probe = registry.clone();
    wait_until("both attempts to finish", || {
        let done = |key: &str| {
            probe
                .get(key)
                .map(|s| !s.active && s.last_outcome.is_some())
                .unwrap_or(false)
        };
        done("app_d1_dataset1") && done("app_d1_dataset2")
    })
    .await;

    let good = registry.get("app_d1_dataset1").unwrap();
    assert_eq!(good.last_outcome.as_deref(), Some("deployed"));
    assert!(good.last_error.is_none());

    let missing = registry.get("app_d1_dataset2").unwrap();
    assert_eq!(missing.last_outcome.as_deref(), Some("failed"));
    assert!(missing.last_error.unwrap().contains("Dockerfile.pf"));

    let _ = stop_tx.send(());
    tokio::time::timeout(Duration::from_secs(10), workers)
        .await
        .unwrap()
        .unwrap();
}
