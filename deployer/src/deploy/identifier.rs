//! Deployment identifiers derived from repository directory names
//!
//! A deployable directory is named
//! `d_{tenant}_dataset{dataset}[_{label}][.{domain}]`. Everything the
//! deployer creates (container, image, proxy site file) is named from the
//! tenant and dataset ids alone.

use std::fmt;
use std::path::Path;

use serde::Serialize;

use crate::errors::DeployError;

const PREFIX: &str = "d_";
const DATASET_MARKER: &str = "_dataset";

/// Tenant/dataset pair parsed from a directory basename.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identifier {
    pub tenant_id: String,
    pub dataset_id: String,
    pub repo_label: Option<String>,
    pub domain: Option<String>,
}

impl Identifier {
    /// Parse the basename of `path`.
    pub fn from_path(path: &Path) -> Result<Self, DeployError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                DeployError::invalid_name(path.display().to_string(), "path has no basename")
            })?;
        Self::parse(&name)
    }

    /// Parse a directory name.
    pub fn parse(name: &str) -> Result<Self, DeployError> {
        let (stem, domain) = match name.split_once('.') {
            Some((stem, domain)) => (stem, Some(domain)),
            None => (name, None),
        };

        if let Some(domain) = domain {
            if !is_valid_domain(domain) {
                return Err(DeployError::invalid_name(name, "malformed domain suffix"));
            }
        }

        let rest = stem
            .strip_prefix(PREFIX)
            .ok_or_else(|| DeployError::invalid_name(name, "missing 'd_' prefix"))?;
        let (tenant, after) = rest
            .split_once(DATASET_MARKER)
            .ok_or_else(|| DeployError::invalid_name(name, "missing '_dataset' segment"))?;

        if !is_valid_segment(tenant) {
            return Err(DeployError::invalid_name(name, "tenant id is empty or has invalid characters"));
        }

        let (dataset, label) = match after.split_once('_') {
            Some((dataset, label)) => (dataset, Some(label)),
            None => (after, None),
        };

        if !is_valid_segment(dataset) {
            return Err(DeployError::invalid_name(name, "dataset id is empty or has invalid characters"));
        }
        if let Some(label) = label {
            if !is_valid_segment(label) {
                return Err(DeployError::invalid_name(name, "repo label is empty or has invalid characters"));
            }
        }

        Ok(Self {
            tenant_id: tenant.to_string(),
            dataset_id: dataset.to_string(),
            repo_label: label.map(str::to_string),
            domain: domain.map(str::to_string),
        })
    }

    /// `d{tenant}_dataset{dataset}`, shared by every derived name.
    fn slug(&self) -> String {
        format!("d{}_dataset{}", self.tenant_id, self.dataset_id)
    }

    pub fn container_name(&self) -> String {
        format!("app_{}", self.slug())
    }

    pub fn image_name(&self) -> String {
        format!("{}:latest", self.container_name())
    }

    /// Public host name; the directory's own domain wins over the default.
    pub fn subdomain(&self, default_suffix: &str) -> String {
        let suffix = self.domain.as_deref().unwrap_or(default_suffix);
        format!("d_{}_dataset{}.{}", self.tenant_id, self.dataset_id, suffix)
    }

    pub fn proxy_config_name(&self) -> String {
        format!("site_{}.conf", self.slug())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tenant={} dataset={}", self.tenant_id, self.dataset_id)?;
        if let Some(label) = &self.repo_label {
            write!(f, " label={}", label)?;
        }
        Ok(())
    }
}

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_valid_domain(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|label| {
            !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}
