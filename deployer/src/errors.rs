//! Error types for the deployer

use thiserror::Error;

/// Failure of one deploy or cleanup attempt.
///
/// None of these are retried automatically; a later filesystem event or the
/// next catch-up pass is the only retry path.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Invalid deployment directory name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Build descriptor not found: {0}")]
    MissingDescriptor(String),

    #[error("Image build failed for {image}: {reason}")]
    BuildFailure { image: String, reason: String },

    #[error("Container {container} failed: {reason}")]
    RunFailure { container: String, reason: String },

    #[error("Proxy config error: {0}")]
    ProxyConfigFailure(String),

    #[error("Proxy reload failed: {0}")]
    ReloadFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn invalid_name(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DeployError::InvalidName {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Short name of the pipeline stage the error belongs to, for logs and
    /// the status table.
    pub fn stage(&self) -> &'static str {
        match self {
            DeployError::InvalidName { .. } | DeployError::MissingDescriptor(_) => "validating",
            DeployError::BuildFailure { .. } => "building",
            DeployError::RunFailure { .. } => "starting",
            DeployError::ProxyConfigFailure(_) => "configuring_proxy",
            DeployError::ReloadFailure(_) => "reloading",
            DeployError::Io(_) | DeployError::Internal(_) => "internal",
        }
    }
}

/// Main error type for the application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Deployment error: {0}")]
    DeployError(#[from] DeployError),

    #[error("Watch error: {0}")]
    WatchError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<notify::Error> for AppError {
    fn from(err: notify::Error) -> Self {
        AppError::WatchError(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
