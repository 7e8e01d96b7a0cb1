//! Application configuration options

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::deploy::fsm::FsmSettings;
use crate::deploy::proxy::ProxyMode;
use crate::deploy::runtime::Mount;
use crate::workers::{deployer, watcher};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Filesystem watcher options
    pub watch: watcher::Options,

    /// Deploy pipeline options
    pub deploy: DeployOptions,

    /// Worker pool options
    pub workers: deployer::Options,

    /// Docker binary used for the runtime and container-mode proxy
    pub docker_binary: String,

    /// Where Nginx runs
    pub proxy_mode: ProxyMode,

    /// Enable the local status server
    pub enable_status_server: bool,

    /// Server configuration
    pub server: ServerOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            watch: watcher::Options::default(),
            deploy: DeployOptions::default(),
            workers: deployer::Options::default(),
            docker_binary: "docker".to_string(),
            proxy_mode: ProxyMode::default(),
            enable_status_server: true,
            server: ServerOptions::default(),
        }
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// How long shutdown waits for in-flight deploys before forcing exit
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(300),
        }
    }
}

/// Options of the deploy pipeline
#[derive(Debug, Clone)]
pub struct DeployOptions {
    /// Build descriptor file name inside each repository
    pub descriptor_name: String,

    /// Shared Docker network
    pub network: String,

    /// Suffix for directories without their own domain
    pub domain_suffix: String,

    /// Site template
    pub template_path: PathBuf,

    /// Directory Nginx loads site files from
    pub sites_dir: PathBuf,

    /// Directory holding orchestrator lock files
    pub lock_dir: PathBuf,

    /// Publish the internal port on this host address. `None` keeps
    /// containers reachable only through the shared network.
    pub publish_host_ip: Option<String>,

    /// Bind mounts for every container
    pub mounts: Vec<MountOption>,

    /// Environment for every container
    pub env: BTreeMap<String, String>,

    /// Docker restart policy
    pub restart_policy: String,

    /// FSM settings
    pub fsm_settings: FsmSettings,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            descriptor_name: "Dockerfile.pf".to_string(),
            network: "pfdeploy".to_string(),
            domain_suffix: "localhost".to_string(),
            template_path: PathBuf::from("/etc/pfdeploy/site.conf.tmpl"),
            sites_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            lock_dir: PathBuf::from("/run/pfdeploy/locks"),
            publish_host_ip: None,
            mounts: Vec::new(),
            env: BTreeMap::new(),
            restart_policy: "unless-stopped".to_string(),
            fsm_settings: FsmSettings::default(),
        }
    }
}

/// Bind mount; relative sources are taken from the repository directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOption {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl MountOption {
    pub fn resolve(&self, repo_path: &Path) -> Mount {
        let source = if self.source.is_absolute() {
            self.source.clone()
        } else {
            repo_path.join(&self.source)
        };
        Mount {
            source,
            target: self.target.clone(),
            read_only: self.read_only,
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8095,
        }
    }
}
