//! Settings file management

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::app::options::{
    AppOptions, DeployOptions, LifecycleOptions, MountOption, ServerOptions,
};
use crate::deploy::fsm::FsmSettings;
use crate::deploy::proxy::ProxyMode;
use crate::errors::AppError;
use crate::filesys::file::File;
use crate::logs::{LogLevel, LogOptions};
use crate::workers::{deployer, watcher};

/// Deployer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log: LogSettings,

    #[serde(default)]
    pub watch: WatchSettings,

    #[serde(default)]
    pub deploy: DeploySettings,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub workers: WorkerSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub lifecycle: LifecycleSettings,
}

fn default_true() -> bool {
    true
}

impl Settings {
    /// Load settings from `file`. A missing file yields the defaults unless
    /// the path was given explicitly.
    pub async fn load(file: &File, explicit: bool) -> Result<Self, AppError> {
        if !file.exists().await {
            if explicit {
                return Err(AppError::ConfigError(format!(
                    "Settings file {} does not exist",
                    file.path().display()
                )));
            }
            info!(
                "No settings file at {}, using defaults",
                file.path().display()
            );
            return Ok(Self::default());
        }

        file.read_json::<Settings>().await.map_err(|e| {
            AppError::ConfigError(format!("Invalid settings file {}: {}", file.path().display(), e))
        })
    }

    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            log_level: self.log.level,
            stdout: self.log.stdout,
            log_dir: self.log.dir.clone(),
            json_format: self.log.json,
        }
    }

    /// Convert into the options the application runs with.
    pub fn to_app_options(&self) -> Result<AppOptions, AppError> {
        if self.workers.count == 0 {
            return Err(AppError::ConfigError("workers.count must be at least 1".to_string()));
        }
        if self.workers.queue_capacity == 0 {
            return Err(AppError::ConfigError(
                "workers.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.watch.descriptor.is_empty() || self.watch.descriptor.contains('/') {
            return Err(AppError::ConfigError(format!(
                "watch.descriptor must be a plain file name, got '{}'",
                self.watch.descriptor
            )));
        }

        let proxy_mode = match self.proxy.mode {
            ProxyKind::Container => ProxyMode::Container {
                container: self.proxy.container.clone(),
            },
            ProxyKind::Host => ProxyMode::Host,
        };

        Ok(AppOptions {
            lifecycle: LifecycleOptions {
                max_shutdown_delay: Duration::from_secs(self.lifecycle.max_shutdown_delay_secs),
            },
            watch: watcher::Options {
                root: self.watch.root.clone(),
                descriptor_name: self.watch.descriptor.clone(),
                settle_delay: Duration::from_secs(self.watch.settle_delay_secs),
                change_debounce: Duration::from_secs(self.watch.change_debounce_secs),
                extra_excludes: self.watch.exclude.clone(),
            },
            deploy: DeployOptions {
                descriptor_name: self.watch.descriptor.clone(),
                network: self.deploy.network.clone(),
                domain_suffix: self.deploy.domain_suffix.clone(),
                template_path: self.deploy.template_path.clone(),
                sites_dir: self.proxy.sites_dir.clone(),
                lock_dir: self.deploy.lock_dir.clone(),
                publish_host_ip: if self.deploy.publish_ports {
                    Some(self.deploy.host_ip.clone())
                } else {
                    None
                },
                mounts: self
                    .deploy
                    .mounts
                    .iter()
                    .map(|m| MountOption {
                        source: m.source.clone(),
                        target: m.target.clone(),
                        read_only: m.read_only,
                    })
                    .collect(),
                env: self.deploy.env.clone(),
                restart_policy: self.deploy.restart_policy.clone(),
                fsm_settings: FsmSettings {
                    dns_retries: self.deploy.dns_retries,
                    dns_retry_delay: Duration::from_secs(self.deploy.dns_retry_delay_secs),
                },
            },
            workers: deployer::Options {
                workers: self.workers.count,
                queue_capacity: self.workers.queue_capacity,
            },
            docker_binary: self.deploy.docker_binary.clone(),
            proxy_mode,
            enable_status_server: self.server.enabled,
            server: ServerOptions {
                host: self.server.host.clone(),
                port: self.server.port,
            },
        })
    }
}

/// Log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default = "default_true")]
    pub stdout: bool,

    #[serde(default)]
    pub json: bool,

    /// Directory of the rolling log file; `null` disables it
    #[serde(default = "default_log_dir")]
    pub dir: Option<PathBuf>,
}

fn default_log_dir() -> Option<PathBuf> {
    Some(PathBuf::from("/var/log/pfdeploy"))
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            stdout: true,
            json: false,
            dir: default_log_dir(),
        }
    }
}

/// Watcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Deployments root
    #[serde(default = "default_watch_root")]
    pub root: PathBuf,

    /// Build descriptor file name
    #[serde(default = "default_descriptor")]
    pub descriptor: String,

    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    #[serde(default = "default_change_debounce")]
    pub change_debounce_secs: u64,

    /// Path segments excluded on top of the built-in list
    #[serde(default)]
    pub exclude: Vec<String>,
}

fn default_watch_root() -> PathBuf {
    PathBuf::from("/srv/deployments")
}

fn default_descriptor() -> String {
    "Dockerfile.pf".to_string()
}

fn default_settle_delay() -> u64 {
    5
}

fn default_change_debounce() -> u64 {
    2
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            root: default_watch_root(),
            descriptor: default_descriptor(),
            settle_delay_secs: default_settle_delay(),
            change_debounce_secs: default_change_debounce(),
            exclude: Vec::new(),
        }
    }
}

/// Deploy pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    #[serde(default = "default_network")]
    pub network: String,

    #[serde(default = "default_domain_suffix")]
    pub domain_suffix: String,

    #[serde(default = "default_template_path")]
    pub template_path: PathBuf,

    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,

    #[serde(default = "default_dns_retries")]
    pub dns_retries: u32,

    #[serde(default = "default_dns_retry_delay")]
    pub dns_retry_delay_secs: u64,

    /// Also publish the internal port on `host_ip`
    #[serde(default)]
    pub publish_ports: bool,

    #[serde(default = "default_host_ip")]
    pub host_ip: String,

    #[serde(default)]
    pub mounts: Vec<MountSettings>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_network() -> String {
    "pfdeploy".to_string()
}

fn default_domain_suffix() -> String {
    "localhost".to_string()
}

fn default_template_path() -> PathBuf {
    PathBuf::from("/etc/pfdeploy/site.conf.tmpl")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("/run/pfdeploy/locks")
}

fn default_dns_retries() -> u32 {
    5
}

fn default_dns_retry_delay() -> u64 {
    5
}

fn default_host_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_restart_policy() -> String {
    "unless-stopped".to_string()
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
            network: default_network(),
            domain_suffix: default_domain_suffix(),
            template_path: default_template_path(),
            lock_dir: default_lock_dir(),
            dns_retries: default_dns_retries(),
            dns_retry_delay_secs: default_dns_retry_delay(),
            publish_ports: false,
            host_ip: default_host_ip(),
            mounts: Vec::new(),
            env: BTreeMap::new(),
            restart_policy: default_restart_policy(),
        }
    }
}

/// Bind mount settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSettings {
    pub source: PathBuf,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    Container,
    Host,
}

/// Reverse proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    #[serde(default)]
    pub mode: ProxyKind,

    /// Proxy container name, used in container mode
    #[serde(default = "default_proxy_container")]
    pub container: String,

    #[serde(default = "default_sites_dir")]
    pub sites_dir: PathBuf,
}

fn default_proxy_container() -> String {
    "nginx-proxy".to_string()
}

fn default_sites_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/sites-enabled")
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            mode: ProxyKind::Container,
            container: default_proxy_container(),
            sites_dir: default_sites_dir(),
        }
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_worker_count() -> usize {
    2
}

fn default_queue_capacity() -> usize {
    64
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Status server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8095
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_max_shutdown_delay")]
    pub max_shutdown_delay_secs: u64,
}

fn default_max_shutdown_delay() -> u64 {
    300
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            max_shutdown_delay_secs: default_max_shutdown_delay(),
        }
    }
}
