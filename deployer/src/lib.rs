//! pfdeploy Library
//!
//! Core modules for the deployment watcher: directory-name parsing, the
//! deploy orchestrator with rollback, filesystem watch streams and the
//! worker pool that connects them.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod server;
pub mod storage;
pub mod utils;
pub mod watch;
pub mod workers;
