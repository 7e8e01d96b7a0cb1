//! Server state

use std::sync::Arc;

use crate::app::state::DeployRegistry;
use crate::filesys::dir::Dir;

/// Server state shared across handlers
pub struct ServerState {
    pub registry: Arc<DeployRegistry>,
    pub sites_dir: Dir,
}

impl ServerState {
    pub fn new(registry: Arc<DeployRegistry>, sites_dir: Dir) -> Self {
        Self {
            registry,
            sites_dir,
        }
    }
}
