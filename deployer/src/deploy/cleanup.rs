//! Teardown of deployments whose directory disappeared

use serde::Serialize;
use tracing::{info, warn, Instrument};

use crate::deploy::identifier::Identifier;
use crate::deploy::lock::DeployLock;
use crate::deploy::orchestrator::Deployer;
use crate::errors::DeployError;
use crate::filesys::file::File;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum CleanupOutcome {
    Removed {
        container_removed: bool,
        site_removed: bool,
    },
    /// The name does not belong to a deployment.
    Skipped { reason: String },
}

impl Deployer {
    /// Remove the container, image and site file belonging to directory
    /// `name`, then reload the proxy if a site file was removed. The lock
    /// file goes last.
    pub async fn cleanup(&self, name: &str) -> Result<CleanupOutcome, DeployError> {
        let span = tracing::info_span!("cleanup", name = %name);
        self.cleanup_impl(name).instrument(span).await
    }

    async fn cleanup_impl(&self, name: &str) -> Result<CleanupOutcome, DeployError> {
        let identifier = match Identifier::parse(name) {
            Ok(identifier) => identifier,
            Err(e) => {
                warn!("Skipping cleanup: {}", e);
                return Ok(CleanupOutcome::Skipped {
                    reason: e.to_string(),
                });
            }
        };
        let container = identifier.container_name();
        let lock = DeployLock::acquire(&self.options().lock_dir, &container).await?;

        let runtime = self.runtime();
        let container_removed = if runtime.container_exists(&container).await? {
            runtime.stop_container(&container).await?;
            runtime.remove_container(&container).await?;
            info!("Removed container {}", container);
            true
        } else {
            false
        };

        let image = identifier.image_name();
        if let Err(e) = runtime.remove_image(&image).await {
            warn!("Could not remove image {}: {}", image, e);
        }

        let site_path = self.site_path(&identifier);
        let site_removed = File::new(&site_path).delete().await.map_err(|e| {
            DeployError::ProxyConfigFailure(format!("cannot remove {}: {}", site_path.display(), e))
        })?;
        if site_removed {
            info!("Removed site file {}", site_path.display());
            self.proxy().validate_and_reload().await?;
        }

        // Nothing left to guard for this identifier
        lock.remove();

        Ok(CleanupOutcome::Removed {
            container_removed,
            site_removed,
        })
    }
}
