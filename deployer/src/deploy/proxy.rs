//! Reverse proxy control

use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deploy::docker::stderr_tail;
use crate::errors::DeployError;

/// Control surface of the shared reverse proxy.
#[async_trait]
pub trait ReverseProxy: Send + Sync {
    /// Whether the proxy can currently resolve `host` to an address.
    async fn resolves(&self, host: &str) -> bool;

    /// Syntax-check the proxy configuration.
    async fn validate(&self) -> Result<(), DeployError>;

    /// Signal the running proxy to reload its configuration.
    async fn reload(&self) -> Result<(), DeployError>;

    /// Make sure the proxy can reach containers on `network`.
    async fn ensure_attached(&self, _network: &str) -> Result<(), DeployError> {
        Ok(())
    }

    /// Validate, then reload. A configuration that fails validation is
    /// never signalled to the proxy.
    async fn validate_and_reload(&self) -> Result<(), DeployError> {
        self.validate().await?;
        self.reload().await
    }
}

/// Where the Nginx process lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ProxyMode {
    /// Nginx runs in a container; commands go through `docker exec`.
    Container { container: String },
    /// Nginx runs on the host.
    Host,
}

impl Default for ProxyMode {
    fn default() -> Self {
        ProxyMode::Container {
            container: "nginx-proxy".to_string(),
        }
    }
}

/// Nginx controlled through its command line.
#[derive(Debug, Clone)]
pub struct NginxProxy {
    mode: ProxyMode,
    docker_binary: String,
}

impl NginxProxy {
    pub fn new(mode: ProxyMode, docker_binary: impl Into<String>) -> Self {
        Self {
            mode,
            docker_binary: docker_binary.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = match &self.mode {
            ProxyMode::Container { container } => {
                let mut command = Command::new(&self.docker_binary);
                command.arg("exec").arg(container).args(args);
                command
            }
            ProxyMode::Host => {
                let mut command = Command::new(args[0]);
                command.args(&args[1..]);
                command
            }
        };
        command.stdin(Stdio::null());
        command
    }

    async fn output(&self, args: &[&str]) -> Result<Output, DeployError> {
        debug!("Running proxy command: {} ({:?})", args.join(" "), self.mode);
        self.command(args)
            .output()
            .await
            .map_err(|e| DeployError::ReloadFailure(format!("Failed to run {}: {}", args[0], e)))
    }
}

#[async_trait]
impl ReverseProxy for NginxProxy {
    async fn resolves(&self, host: &str) -> bool {
        match self.output(&["getent", "hosts", host]).await {
            Ok(output) => output.status.success() && !output.stdout.is_empty(),
            Err(e) => {
                debug!("DNS probe for {} failed to run: {}", host, e);
                false
            }
        }
    }

    async fn validate(&self) -> Result<(), DeployError> {
        let output = self.output(&["nginx", "-t"]).await?;
        if !output.status.success() {
            return Err(DeployError::ReloadFailure(format!(
                "configuration test failed: {}",
                stderr_tail(&output)
            )));
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), DeployError> {
        let output = self.output(&["nginx", "-s", "reload"]).await?;
        if !output.status.success() {
            return Err(DeployError::ReloadFailure(format!(
                "reload signal failed: {}",
                stderr_tail(&output)
            )));
        }
        info!("Reverse proxy reloaded");
        Ok(())
    }

    async fn ensure_attached(&self, network: &str) -> Result<(), DeployError> {
        let ProxyMode::Container { container } = &self.mode else {
            return Ok(());
        };

        let output = Command::new(&self.docker_binary)
            .args(["network", "connect", network, container])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DeployError::Internal(format!("Failed to run docker network connect: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("already exists") {
                return Ok(());
            }
            warn!(
                "Could not attach proxy {} to network {}: {}",
                container,
                network,
                stderr.trim()
            );
        }
        Ok(())
    }
}
