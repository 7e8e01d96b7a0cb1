//! Finite State Machine for one deploy attempt

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// FSM settings
#[derive(Debug, Clone)]
pub struct FsmSettings {
    /// Attempts at resolving the new container from the proxy
    pub dns_retries: u32,

    /// Delay between DNS attempts
    pub dns_retry_delay: Duration,
}

impl Default for FsmSettings {
    fn default() -> Self {
        Self {
            dns_retries: 5,
            dns_retry_delay: Duration::from_secs(5),
        }
    }
}

/// Deploy stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    /// Nothing started yet
    Idle,

    /// Name, lock and descriptor checks
    Validating,

    /// Image build
    Building,

    /// Old container replaced by the new one
    Starting,

    /// Waiting for the proxy to resolve the container
    AwaitingDns,

    /// Writing the site file
    ConfiguringProxy,

    /// Validating and reloading the proxy
    Reloading,

    /// Deployed
    Done,

    /// Nothing to do (already running or another attempt holds the lock)
    Skipped,

    /// Failed, rollback applied
    Failed,
}

impl DeployStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeployStage::Done | DeployStage::Skipped | DeployStage::Failed
        )
    }
}

/// Deploy event
#[derive(Debug, Clone)]
pub enum DeployEvent {
    /// Attempt started
    Begin,

    /// Checks passed, work is needed
    Validated,

    /// Checks showed there is nothing to do
    Skip,

    /// Image built
    Built,

    /// Container started
    Started,

    /// Proxy resolves the container
    DnsReady,

    /// Site file written
    ProxyConfigured,

    /// Proxy reloaded
    Reloaded,

    /// Stage failed
    Fail(String),
}

/// Deploy FSM
#[derive(Debug, Clone)]
pub struct DeployFsm {
    state: DeployStage,
    error: Option<String>,
    failed_stage: Option<DeployStage>,
}

impl DeployFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            state: DeployStage::Idle,
            error: None,
            failed_stage: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeployStage {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Stage that was active when the attempt failed
    pub fn failed_stage(&self) -> Option<DeployStage> {
        self.failed_stage
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeployEvent) -> Result<(), String> {
        let new_state = match (self.state, &event) {
            (DeployStage::Idle, DeployEvent::Begin) => DeployStage::Validating,

            (DeployStage::Validating, DeployEvent::Validated) => DeployStage::Building,
            (DeployStage::Validating, DeployEvent::Skip) => DeployStage::Skipped,

            (DeployStage::Building, DeployEvent::Built) => DeployStage::Starting,
            (DeployStage::Starting, DeployEvent::Started) => DeployStage::AwaitingDns,
            (DeployStage::AwaitingDns, DeployEvent::DnsReady) => DeployStage::ConfiguringProxy,
            (DeployStage::ConfiguringProxy, DeployEvent::ProxyConfigured) => DeployStage::Reloading,
            (DeployStage::Reloading, DeployEvent::Reloaded) => DeployStage::Done,

            (
                stage @ (DeployStage::Validating
                | DeployStage::Building
                | DeployStage::Starting
                | DeployStage::AwaitingDns
                | DeployStage::ConfiguringProxy
                | DeployStage::Reloading),
                DeployEvent::Fail(err),
            ) => {
                self.error = Some(err.clone());
                self.failed_stage = Some(stage);
                DeployStage::Failed
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeployFsm {
    fn default() -> Self {
        Self::new()
    }
}
