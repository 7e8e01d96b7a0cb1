//! Container runtime seam
//!
//! The orchestrator only talks to the container daemon through
//! [`ContainerRuntime`]; [`crate::deploy::docker::DockerCli`] is the
//! production implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::errors::DeployError;

/// A bind mount passed to `docker run -v`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

/// Publish the container port on the host. Docker picks the host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPublish {
    pub host_ip: String,
    pub container_port: u16,
}

/// Everything needed to start one application container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub publish: Option<PortPublish>,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,
    pub restart_policy: String,
}

impl RunSpec {
    /// Arguments following `docker run`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--network".to_string(),
            self.network.clone(),
            "--restart".to_string(),
            self.restart_policy.clone(),
        ];

        if let Some(publish) = &self.publish {
            args.push("-p".to_string());
            args.push(format!("{}::{}", publish.host_ip, publish.container_port));
        }

        for mount in &self.mounts {
            let mut volume = format!("{}:{}", mount.source.display(), mount.target);
            if mount.read_only {
                volume.push_str(":ro");
            }
            args.push("-v".to_string());
            args.push(volume);
        }

        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.image.clone());
        args
    }
}

/// Image and container operations used by the deploy pipeline.
///
/// `stop_container`, `remove_container` and `remove_image` succeed when the
/// target does not exist.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool, DeployError>;

    async fn remove_image(&self, image: &str) -> Result<(), DeployError>;

    async fn build_image(
        &self,
        context: &Path,
        descriptor: &Path,
        image: &str,
    ) -> Result<(), DeployError>;

    async fn container_exists(&self, name: &str) -> Result<bool, DeployError>;

    async fn container_running(&self, name: &str) -> Result<bool, DeployError>;

    async fn stop_container(&self, name: &str) -> Result<(), DeployError>;

    async fn remove_container(&self, name: &str) -> Result<(), DeployError>;

    async fn ensure_network(&self, network: &str) -> Result<(), DeployError>;

    async fn run_container(&self, spec: &RunSpec) -> Result<(), DeployError>;
}
