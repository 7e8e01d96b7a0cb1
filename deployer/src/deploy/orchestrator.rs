//! Deploy orchestrator
//!
//! Drives one repository through validate, build, start, DNS gate, proxy
//! config and reload. Any failure after validation rolls back whatever the
//! attempt created before the error is returned.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::app::options::DeployOptions;
use crate::deploy::descriptor::Descriptor;
use crate::deploy::fsm::{DeployEvent, DeployFsm, DeployStage};
use crate::deploy::identifier::Identifier;
use crate::deploy::lock::DeployLock;
use crate::deploy::proxy::ReverseProxy;
use crate::deploy::runtime::{ContainerRuntime, PortPublish, RunSpec};
use crate::deploy::template::{ProxyTemplate, RouteFields};
use crate::errors::DeployError;
use crate::filesys::file::File;

/// Receives stage transitions of running attempts.
pub trait StageObserver: Send + Sync {
    fn on_stage(&self, container: &str, stage: DeployStage);

    /// The attempt failed while in `stage`.
    fn on_failure(&self, container: &str, stage: DeployStage, error: &str);
}

/// One deploy invocation.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub repo_path: PathBuf,
    /// Skip the "already running" check and always rebuild.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    LockHeld,
}

/// The live state produced by a successful deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeploymentUnit {
    pub identifier: Identifier,
    pub container_name: String,
    pub image_name: String,
    pub internal_port: u16,
    pub subdomain: String,
    pub proxy_config_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    Deployed(DeploymentUnit),
    Skipped(SkipReason),
}

/// What an attempt has created so far and must undo on failure.
#[derive(Debug, Default)]
struct Rollback {
    container: Option<String>,
    site_file: Option<PathBuf>,
    image: Option<String>,
}

/// Runs deploy and cleanup attempts against a container runtime and proxy.
pub struct Deployer {
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<dyn ReverseProxy>,
    options: DeployOptions,
    observer: Option<Arc<dyn StageObserver>>,
}

impl Deployer {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<dyn ReverseProxy>,
        options: DeployOptions,
    ) -> Self {
        Self {
            runtime,
            proxy,
            options,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn StageObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn options(&self) -> &DeployOptions {
        &self.options
    }

    pub(crate) fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub(crate) fn proxy(&self) -> &dyn ReverseProxy {
        self.proxy.as_ref()
    }

    /// Deploy one repository directory.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError> {
        let attempt = Uuid::new_v4();
        let span = tracing::info_span!(
            "deploy",
            %attempt,
            repo = %request.repo_path.display(),
            force = request.force
        );
        self.deploy_impl(request).instrument(span).await
    }

    async fn deploy_impl(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError> {
        let identifier = Identifier::from_path(&request.repo_path).map_err(|e| {
            error!("Refusing to deploy: {}", e);
            e
        })?;
        let container = identifier.container_name();
        let mut fsm = DeployFsm::new();
        self.advance(&mut fsm, &container, DeployEvent::Begin)?;

        let _lock = match DeployLock::try_acquire(&self.options.lock_dir, &container) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                info!("Another deploy of {} holds the lock, skipping", container);
                self.advance(&mut fsm, &container, DeployEvent::Skip)?;
                return Ok(DeployOutcome::Skipped(SkipReason::LockHeld));
            }
            Err(e) => return Err(self.fail(&mut fsm, &container, e)),
        };

        let descriptor =
            match Descriptor::load(&request.repo_path, &self.options.descriptor_name).await {
                Ok(descriptor) => descriptor,
                Err(e) => return Err(self.fail(&mut fsm, &container, e)),
            };

        if !request.force {
            match self.runtime.container_running(&container).await {
                Ok(true) => {
                    info!("{} is already running, nothing to do", container);
                    self.advance(&mut fsm, &container, DeployEvent::Skip)?;
                    return Ok(DeployOutcome::Skipped(SkipReason::AlreadyRunning));
                }
                Ok(false) => {}
                Err(e) => return Err(self.fail(&mut fsm, &container, e)),
            }
        }

        info!(
            "Deploying {} ({}) from {}",
            container,
            identifier,
            request.repo_path.display()
        );
        self.advance(&mut fsm, &container, DeployEvent::Validated)?;

        let mut rollback = Rollback::default();
        match self
            .run_pipeline(&mut fsm, request, &identifier, &descriptor, &mut rollback)
            .await
        {
            Ok(unit) => {
                info!(
                    "Deployed {} at {} (port {})",
                    unit.container_name, unit.subdomain, unit.internal_port
                );
                Ok(DeployOutcome::Deployed(unit))
            }
            Err(e) => {
                let stage = fsm.state();
                let e = self.fail(&mut fsm, &container, e);
                error!("Deploy of {} failed during {:?}: {}", container, stage, e);
                self.rollback(&rollback).await;
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        fsm: &mut DeployFsm,
        request: &DeployRequest,
        identifier: &Identifier,
        descriptor: &Descriptor,
        rollback: &mut Rollback,
    ) -> Result<DeploymentUnit, DeployError> {
        let container = identifier.container_name();
        let image = identifier.image_name();

        // Building
        if let Err(e) = self.runtime.remove_image(&image).await {
            warn!("Could not remove stale image {}: {}", image, e);
        }
        rollback.image = Some(image.clone());
        self.runtime
            .build_image(&request.repo_path, &descriptor.path, &image)
            .await?;
        self.advance(fsm, &container, DeployEvent::Built)?;

        // Starting
        self.runtime
            .ensure_network(&self.options.network)
            .await
            .map_err(|e| DeployError::RunFailure {
                container: container.clone(),
                reason: format!("network {} unavailable: {}", self.options.network, e),
            })?;
        if let Err(e) = self.proxy.ensure_attached(&self.options.network).await {
            warn!("Could not attach proxy to {}: {}", self.options.network, e);
        }
        self.runtime.stop_container(&container).await?;
        self.runtime.remove_container(&container).await?;

        // The previous container is gone, so an existing route for it is dangling
        let site_path = self.site_path(identifier);
        if File::new(&site_path).exists().await {
            rollback.site_file = Some(site_path.clone());
        }

        rollback.container = Some(container.clone());
        let spec = self.run_spec(identifier, &request.repo_path, descriptor.internal_port);
        self.runtime.run_container(&spec).await?;
        self.advance(fsm, &container, DeployEvent::Started)?;

        // AwaitingDns
        self.await_dns(&container).await?;
        self.advance(fsm, &container, DeployEvent::DnsReady)?;

        // ConfiguringProxy
        let rendered = self
            .render_site(identifier, descriptor.internal_port)
            .await?;
        rollback.site_file = Some(site_path.clone());
        File::new(&site_path)
            .write_atomic(rendered.as_bytes())
            .await
            .map_err(|e| {
                DeployError::ProxyConfigFailure(format!(
                    "cannot write {}: {}",
                    site_path.display(),
                    e
                ))
            })?;
        debug!("Wrote site file {}", site_path.display());
        self.advance(fsm, &container, DeployEvent::ProxyConfigured)?;

        // Reloading
        self.proxy.validate_and_reload().await?;
        self.advance(fsm, &container, DeployEvent::Reloaded)?;

        Ok(DeploymentUnit {
            identifier: identifier.clone(),
            container_name: container,
            image_name: image,
            internal_port: descriptor.internal_port,
            subdomain: identifier.subdomain(&self.options.domain_suffix),
            proxy_config_path: site_path,
        })
    }

    /// Render the site file for the repository at `repo_path` without
    /// touching anything.
    pub async fn render_for_repo(&self, repo_path: &Path) -> Result<String, DeployError> {
        let identifier = Identifier::from_path(repo_path)?;
        let descriptor = Descriptor::load(repo_path, &self.options.descriptor_name).await?;
        self.render_site(&identifier, descriptor.internal_port).await
    }

    async fn render_site(&self, identifier: &Identifier, port: u16) -> Result<String, DeployError> {
        let template_file = File::new(&self.options.template_path);
        let text = template_file.read_string().await.map_err(|e| {
            DeployError::ProxyConfigFailure(format!(
                "cannot read template {}: {}",
                self.options.template_path.display(),
                e
            ))
        })?;
        let template = ProxyTemplate::parse(&text)?;

        Ok(template.render(&RouteFields {
            subdomain: identifier.subdomain(&self.options.domain_suffix),
            container_name: identifier.container_name(),
            port,
            tenant_id: identifier.tenant_id.clone(),
            dataset_id: identifier.dataset_id.clone(),
        }))
    }

    pub(crate) fn site_path(&self, identifier: &Identifier) -> PathBuf {
        self.options.sites_dir.join(identifier.proxy_config_name())
    }

    fn run_spec(&self, identifier: &Identifier, repo_path: &Path, port: u16) -> RunSpec {
        let mut labels = vec![
            ("pfdeploy.tenant".to_string(), identifier.tenant_id.clone()),
            ("pfdeploy.dataset".to_string(), identifier.dataset_id.clone()),
        ];
        if let Some(label) = &identifier.repo_label {
            labels.push(("pfdeploy.label".to_string(), label.clone()));
        }

        RunSpec {
            name: identifier.container_name(),
            image: identifier.image_name(),
            network: self.options.network.clone(),
            publish: self.options.publish_host_ip.as_ref().map(|host_ip| PortPublish {
                host_ip: host_ip.clone(),
                container_port: port,
            }),
            mounts: self
                .options
                .mounts
                .iter()
                .map(|m| m.resolve(repo_path))
                .collect(),
            env: self
                .options
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            labels,
            restart_policy: self.options.restart_policy.clone(),
        }
    }

    /// Poll the proxy until it resolves `container`. Container network
    /// registration lags behind `docker run`.
    async fn await_dns(&self, container: &str) -> Result<(), DeployError> {
        let settings = &self.options.fsm_settings;
        let attempts = settings.dns_retries.max(1);

        for attempt in 1..=attempts {
            if self.proxy.resolves(container).await {
                debug!("Proxy resolves {} (attempt {})", container, attempt);
                return Ok(());
            }
            debug!(
                "Proxy cannot resolve {} yet (attempt {}/{})",
                container, attempt, attempts
            );
            if attempt < attempts {
                tokio::time::sleep(settings.dns_retry_delay).await;
            }
        }

        Err(DeployError::RunFailure {
            container: container.to_string(),
            reason: format!("DNS not ready after {} attempts", attempts),
        })
    }

    /// Best-effort undo. Sub-step errors are logged and never replace the
    /// original failure.
    async fn rollback(&self, rollback: &Rollback) {
        if let Some(container) = &rollback.container {
            info!("Rolling back container {}", container);
            if let Err(e) = self.runtime.stop_container(container).await {
                warn!("Rollback: failed to stop {}: {}", container, e);
            }
            if let Err(e) = self.runtime.remove_container(container).await {
                warn!("Rollback: failed to remove {}: {}", container, e);
            }
        }

        if let Some(site_path) = &rollback.site_file {
            match File::new(site_path).delete().await {
                Ok(true) => {
                    info!("Rollback: removed site file {}", site_path.display());
                    if let Err(e) = self.proxy.validate_and_reload().await {
                        warn!("Rollback: proxy reload failed: {}", e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Rollback: failed to remove {}: {}", site_path.display(), e),
            }
        }

        if let Some(image) = &rollback.image {
            if let Err(e) = self.runtime.remove_image(image).await {
                warn!("Rollback: failed to remove image {}: {}", image, e);
            }
        }
    }

    fn advance(
        &self,
        fsm: &mut DeployFsm,
        container: &str,
        event: DeployEvent,
    ) -> Result<(), DeployError> {
        fsm.process(event).map_err(DeployError::Internal)?;
        debug!("{} -> {:?}", container, fsm.state());
        self.notify(container, fsm.state());
        Ok(())
    }

    fn fail(&self, fsm: &mut DeployFsm, container: &str, err: DeployError) -> DeployError {
        if let Err(e) = fsm.process(DeployEvent::Fail(err.to_string())) {
            warn!("{}", e);
        }
        self.notify(container, fsm.state());
        if let (Some(observer), Some(stage), Some(error)) =
            (&self.observer, fsm.failed_stage(), fsm.error())
        {
            observer.on_failure(container, stage, error);
        }
        err
    }

    fn notify(&self, container: &str, stage: DeployStage) {
        if let Some(observer) = &self.observer {
            observer.on_stage(container, stage);
        }
    }
}
