//! Docker CLI runtime

use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::deploy::runtime::{ContainerRuntime, RunSpec};
use crate::errors::DeployError;

/// Lines of stderr carried into error messages.
const STDERR_TAIL_LINES: usize = 15;

/// Drives the Docker daemon through the `docker` binary.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn output(&self, args: &[&str]) -> Result<Output, DeployError> {
        debug!("Running {} {}", self.binary, args.join(" "));
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::Internal(format!("Failed to run {}: {}", self.binary, e)))
    }

    async fn succeeds(&self, args: &[&str]) -> Result<bool, DeployError> {
        Ok(self.output(args).await?.status.success())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

/// Last lines of a command's stderr, for error messages.
pub fn stderr_tail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    let tail = lines[start..].join("\n");
    if tail.is_empty() {
        format!("exit status {}", output.status)
    } else {
        tail
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn image_exists(&self, image: &str) -> Result<bool, DeployError> {
        self.succeeds(&["image", "inspect", image]).await
    }

    async fn remove_image(&self, image: &str) -> Result<(), DeployError> {
        if !self.image_exists(image).await? {
            return Ok(());
        }
        // -f untags even while a running container still uses the image
        let output = self.output(&["rmi", "-f", image]).await?;
        if !output.status.success() {
            return Err(DeployError::Internal(format!(
                "docker rmi {} failed: {}",
                image,
                stderr_tail(&output)
            )));
        }
        Ok(())
    }

    async fn build_image(
        &self,
        context: &Path,
        descriptor: &Path,
        image: &str,
    ) -> Result<(), DeployError> {
        let descriptor = descriptor.to_string_lossy();
        let context = context.to_string_lossy();
        let output = self
            .output(&["build", "-f", &descriptor, "-t", image, &context])
            .await?;

        debug!(
            "docker build output for {}:\n{}",
            image,
            String::from_utf8_lossy(&output.stdout)
        );

        if !output.status.success() {
            return Err(DeployError::BuildFailure {
                image: image.to_string(),
                reason: stderr_tail(&output),
            });
        }
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool, DeployError> {
        self.succeeds(&["container", "inspect", name]).await
    }

    async fn container_running(&self, name: &str) -> Result<bool, DeployError> {
        let output = self
            .output(&["container", "inspect", "-f", "{{.State.Running}}", name])
            .await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn stop_container(&self, name: &str) -> Result<(), DeployError> {
        if !self.container_running(name).await? {
            return Ok(());
        }
        let output = self.output(&["stop", name]).await?;
        if !output.status.success() {
            return Err(DeployError::RunFailure {
                container: name.to_string(),
                reason: format!("docker stop failed: {}", stderr_tail(&output)),
            });
        }
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<(), DeployError> {
        if !self.container_exists(name).await? {
            return Ok(());
        }
        let output = self.output(&["rm", "-f", name]).await?;
        if !output.status.success() {
            return Err(DeployError::RunFailure {
                container: name.to_string(),
                reason: format!("docker rm failed: {}", stderr_tail(&output)),
            });
        }
        Ok(())
    }

    async fn ensure_network(&self, network: &str) -> Result<(), DeployError> {
        if self.succeeds(&["network", "inspect", network]).await? {
            return Ok(());
        }
        debug!("Creating docker network {}", network);
        let output = self.output(&["network", "create", network]).await?;
        // A concurrent deploy may have created it in the meantime
        if !output.status.success() && !self.succeeds(&["network", "inspect", network]).await? {
            return Err(DeployError::Internal(format!(
                "docker network create {} failed: {}",
                network,
                stderr_tail(&output)
            )));
        }
        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<(), DeployError> {
        let mut args = vec!["run".to_string()];
        args.extend(spec.to_args());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = self.output(&args).await?;
        if !output.status.success() {
            return Err(DeployError::RunFailure {
                container: spec.name.clone(),
                reason: format!("docker run failed: {}", stderr_tail(&output)),
            });
        }
        Ok(())
    }
}
