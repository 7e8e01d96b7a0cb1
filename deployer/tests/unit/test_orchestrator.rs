//! Deploy orchestrator tests

#[path = "support.rs"]
mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pfdeploy::app::state::DeployRegistry;
use pfdeploy::deploy::cleanup::CleanupOutcome;
use pfdeploy::deploy::fsm::DeployStage;
use pfdeploy::deploy::orchestrator::{DeployOutcome, DeployRequest, SkipReason};
use pfdeploy::errors::DeployError;
use support::{descriptor, TestEnv, DOMAIN_SUFFIX};
use tokio_test::{assert_err, assert_ok};

fn request(repo: &std::path::Path, force: bool) -> DeployRequest {
    DeployRequest {
        repo_path: repo.to_path_buf(),
        force,
    }
}

#[tokio::test]
async fn test_deploy_new_repository() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));

    let outcome = assert_ok!(env.deployer().deploy(&request(&repo, false)).await);
    let DeployOutcome::Deployed(unit) = outcome else {
        panic!("expected a deployment, got {:?}", outcome);
    };

    assert_eq!(unit.container_name, "app_d42_dataset7");
    assert_eq!(unit.image_name, "app_d42_dataset7:latest");
    assert_eq!(unit.internal_port, 3000);
    assert_eq!(unit.subdomain, format!("d_42_dataset7.{}", DOMAIN_SUFFIX));
    assert_eq!(unit.proxy_config_path, env.site_file("42", "7"));

    assert!(env.runtime.is_running("app_d42_dataset7"));
    assert!(env.runtime.has_image("app_d42_dataset7:latest"));
    assert!(env.runtime.has_network("pfdeploy"));

    let site = std::fs::read_to_string(env.site_file("42", "7")).unwrap();
    assert!(site.contains("server_name d_42_dataset7.apps.test;"));
    assert!(site.contains("proxy_pass http://app_d42_dataset7:3000;"));
    assert!(!site.contains("{{"));
    assert_eq!(env.proxy.reload_count(), 1);
}

#[tokio::test]
async fn test_container_spec() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_3_dataset4_frontend", Some(&descriptor(5000)));

    assert_ok!(env.deployer().deploy(&request(&repo, false)).await);

    let container = env.runtime.container("app_d3_dataset4").unwrap();
    assert_eq!(container.spec.image, "app_d3_dataset4:latest");
    assert_eq!(container.spec.network, "pfdeploy");
    assert_eq!(container.spec.restart_policy, "unless-stopped");
    assert!(container.spec.publish.is_none());
    assert!(container
        .spec
        .labels
        .contains(&("pfdeploy.label".to_string(), "frontend".to_string())));
}

#[tokio::test]
async fn test_domain_from_directory_name() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_5_dataset9.example.org", Some(&descriptor(8000)));

    let outcome = assert_ok!(env.deployer().deploy(&request(&repo, false)).await);
    let DeployOutcome::Deployed(unit) = outcome else {
        panic!("expected a deployment");
    };
    assert_eq!(unit.subdomain, "d_5_dataset9.example.org");

    let site = std::fs::read_to_string(env.site_file("5", "9")).unwrap();
    assert!(site.contains("server_name d_5_dataset9.example.org;"));
}

#[tokio::test]
async fn test_default_port_without_expose() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_1_dataset1", Some("FROM nginx:alpine\n"));

    let outcome = assert_ok!(env.deployer().deploy(&request(&repo, false)).await);
    let DeployOutcome::Deployed(unit) = outcome else {
        panic!("expected a deployment");
    };
    assert_eq!(unit.internal_port, 8080);
}

#[tokio::test]
async fn test_deploy_is_idempotent() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let deployer = env.deployer();

    assert_ok!(deployer.deploy(&request(&repo, false)).await);
    let generation = env.runtime.container("app_d42_dataset7").unwrap().generation;

    let outcome = assert_ok!(deployer.deploy(&request(&repo, false)).await);
    assert_eq!(outcome, DeployOutcome::Skipped(SkipReason::AlreadyRunning));

    assert_eq!(env.runtime.build_count(), 1);
    assert_eq!(env.runtime.container_count(), 1);
    assert_eq!(
        env.runtime.container("app_d42_dataset7").unwrap().generation,
        generation
    );
    assert_eq!(env.site_files().len(), 1);
    assert_eq!(env.proxy.reload_count(), 1);
}

#[tokio::test]
async fn test_forced_redeploy_replaces_container() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let deployer = env.deployer();

    assert_ok!(deployer.deploy(&request(&repo, false)).await);
    let first = env.runtime.container("app_d42_dataset7").unwrap().generation;

    std::fs::write(repo.join("Dockerfile.pf"), descriptor(4000)).unwrap();
    let outcome = assert_ok!(deployer.deploy(&request(&repo, true)).await);
    assert!(matches!(outcome, DeployOutcome::Deployed(ref unit) if unit.internal_port == 4000));

    let container = env.runtime.container("app_d42_dataset7").unwrap();
    assert!(container.generation > first);
    assert!(container.running);
    assert_eq!(env.runtime.container_count(), 1);
    assert_eq!(env.runtime.build_count(), 2);

    let site = std::fs::read_to_string(env.site_file("42", "7")).unwrap();
    assert!(site.contains("proxy_pass http://app_d42_dataset7:4000;"));
    assert_eq!(env.site_files().len(), 1);
}

#[tokio::test]
async fn test_concurrent_deploys_are_exclusive() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let gate = env.runtime.gate_builds();

    let deployer = Arc::new(env.deployer());
    let first = {
        let deployer = deployer.clone();
        let request = request(&repo, true);
        tokio::spawn(async move { deployer.deploy(&request).await })
    };

    let runtime = env.runtime.clone();
    support::wait_until("the first build to start", || {
        runtime.builds_started.load(Ordering::SeqCst) == 1
    })
    .await;

    let second = assert_ok!(deployer.deploy(&request(&repo, true)).await);
    assert_eq!(second, DeployOutcome::Skipped(SkipReason::LockHeld));

    gate.add_permits(1);
    let first = tokio::time::timeout(Duration::from_secs(10), first)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(first, Ok(DeployOutcome::Deployed(_))));
    assert_eq!(env.runtime.builds_started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_different_identifiers_deploy_concurrently() {
    let env = TestEnv::new();
    let a = env.create_repo("d_1_dataset1", Some(&descriptor(3000)));
    let b = env.create_repo("d_1_dataset2", Some(&descriptor(3001)));
    let deployer = env.deployer();

    let (ra, rb) = (request(&a, false), request(&b, false));
    let (first, second) = tokio::join!(deployer.deploy(&ra), deployer.deploy(&rb));
    assert!(matches!(first, Ok(DeployOutcome::Deployed(_))));
    assert!(matches!(second, Ok(DeployOutcome::Deployed(_))));
    assert_eq!(env.runtime.container_count(), 2);
    assert_eq!(env.site_files().len(), 2);
}

#[tokio::test]
async fn test_invalid_name_is_rejected() {
    let env = TestEnv::new();
    let repo = env.create_repo("bad-name", Some(&descriptor(3000)));

    let err = assert_err!(env.deployer().deploy(&request(&repo, false)).await);
    assert!(matches!(err, DeployError::InvalidName { .. }));
    assert_eq!(env.runtime.builds_started.load(Ordering::SeqCst), 0);
    assert_eq!(env.runtime.container_count(), 0);
    assert!(env.site_files().is_empty());
}

#[tokio::test]
async fn test_missing_descriptor() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_1_dataset2", None);

    let err = assert_err!(env.deployer().deploy(&request(&repo, false)).await);
    assert!(matches!(err, DeployError::MissingDescriptor(_)));
    assert_eq!(env.runtime.builds_started.load(Ordering::SeqCst), 0);
    assert!(!env.runtime.has_image("app_d1_dataset2:latest"));
    assert_eq!(env.runtime.container_count(), 0);
    assert!(env.site_files().is_empty());
}

#[tokio::test]
async fn test_build_failure_leaves_nothing() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    env.runtime.fail_build.store(true, Ordering::SeqCst);

    let err = assert_err!(env.deployer().deploy(&request(&repo, false)).await);
    assert!(matches!(err, DeployError::BuildFailure { .. }));
    assert!(!env.runtime.has_image("app_d42_dataset7:latest"));
    assert_eq!(env.runtime.container_count(), 0);
    assert!(env.site_files().is_empty());
    assert_eq!(env.proxy.reload_count(), 0);
}

#[tokio::test]
async fn test_run_failure_rolls_back() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    env.runtime.fail_run.store(true, Ordering::SeqCst);

    let err = assert_err!(env.deployer().deploy(&request(&repo, false)).await);
    assert!(matches!(err, DeployError::RunFailure { .. }));
    assert!(!env.runtime.has_image("app_d42_dataset7:latest"));
    assert_eq!(env.runtime.container_count(), 0);
    assert!(env.site_files().is_empty());
}

#[tokio::test]
async fn test_dns_failure_rolls_back() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    env.proxy.dns_ok.store(false, Ordering::SeqCst);

    let err = assert_err!(env.deployer().deploy(&request(&repo, false)).await);
    match err {
        DeployError::RunFailure { container, reason } => {
            assert_eq!(container, "app_d42_dataset7");
            assert!(reason.contains("DNS"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(env.proxy.dns_probes.load(Ordering::SeqCst), 3);
    assert_eq!(env.runtime.container_count(), 0);
    assert!(!env.runtime.has_image("app_d42_dataset7:latest"));
    assert!(env.site_files().is_empty());
    assert_eq!(env.proxy.reload_count(), 0);
}

#[tokio::test]
async fn test_reload_failure_rolls_back() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    env.proxy.fail_reload.store(true, Ordering::SeqCst);

    let err = assert_err!(env.deployer().deploy(&request(&repo, false)).await);
    assert!(matches!(err, DeployError::ReloadFailure(_)));
    assert_eq!(env.runtime.container_count(), 0);
    assert!(!env.runtime.has_image("app_d42_dataset7:latest"));
    assert!(!env.site_file("42", "7").exists());
}

#[tokio::test]
async fn test_invalid_config_is_never_reloaded() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    env.proxy.fail_validate.store(true, Ordering::SeqCst);

    let err = assert_err!(env.deployer().deploy(&request(&repo, false)).await);
    assert!(matches!(err, DeployError::ReloadFailure(_)));
    assert_eq!(env.proxy.reload_count(), 0);
    assert!(env.site_files().is_empty());
}

#[tokio::test]
async fn test_broken_template_rolls_back() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    std::fs::write(&env.template, "server_name {{HOSTNAME}};\n").unwrap();

    let err = assert_err!(env.deployer().deploy(&request(&repo, false)).await);
    assert!(matches!(err, DeployError::ProxyConfigFailure(_)));
    assert_eq!(env.runtime.container_count(), 0);
    assert!(env.site_files().is_empty());
}

#[tokio::test]
async fn test_stages_are_reported() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let registry = Arc::new(DeployRegistry::new());
    let deployer = env.deployer().with_observer(registry.clone());

    assert_ok!(deployer.deploy(&request(&repo, false)).await);
    let status = registry.get("app_d42_dataset7").unwrap();
    assert_eq!(status.stage, DeployStage::Done);
    assert!(status.failed_stage.is_none());

    env.proxy.fail_reload.store(true, Ordering::SeqCst);
    assert_err!(deployer.deploy(&request(&repo, true)).await);
    let status = registry.get("app_d42_dataset7").unwrap();
    assert_eq!(status.stage, DeployStage::Failed);
    assert_eq!(status.failed_stage, Some(DeployStage::Reloading));
    assert!(status.last_error.unwrap().contains("reload signal failed"));
}

#[tokio::test]
async fn test_cleanup_removes_everything() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));
    let deployer = env.deployer();
    assert_ok!(deployer.deploy(&request(&repo, false)).await);
    let lock_file = env.locks.join("app_d42_dataset7.lock");
    assert!(lock_file.exists());

    std::fs::remove_dir_all(&repo).unwrap();
    let outcome = assert_ok!(deployer.cleanup("d_42_dataset7").await);
    assert_eq!(
        outcome,
        CleanupOutcome::Removed {
            container_removed: true,
            site_removed: true,
        }
    );

    assert_eq!(env.runtime.container_count(), 0);
    assert!(!env.runtime.has_image("app_d42_dataset7:latest"));
    assert!(env.site_files().is_empty());
    assert_eq!(env.proxy.reload_count(), 2);
    assert!(!lock_file.exists());
}

#[tokio::test]
async fn test_cleanup_of_unknown_deployment() {
    let env = TestEnv::new();

    let outcome = assert_ok!(env.deployer().cleanup("d_9_dataset9").await);
    assert_eq!(
        outcome,
        CleanupOutcome::Removed {
            container_removed: false,
            site_removed: false,
        }
    );
    assert_eq!(env.proxy.reload_count(), 0);

    let outcome = assert_ok!(env.deployer().cleanup("bad-name").await);
    assert!(matches!(outcome, CleanupOutcome::Skipped { .. }));
}

#[tokio::test]
async fn test_render_for_repo() {
    let env = TestEnv::new();
    let repo = env.create_repo("d_42_dataset7", Some(&descriptor(3000)));

    let rendered = assert_ok!(env.deployer().render_for_repo(&repo).await);
    assert!(rendered.contains("server_name d_42_dataset7.apps.test;"));
    assert!(rendered.contains("tenant 42, dataset 7"));
    assert!(env.site_files().is_empty());
    assert_eq!(env.runtime.builds_started.load(Ordering::SeqCst), 0);
}
