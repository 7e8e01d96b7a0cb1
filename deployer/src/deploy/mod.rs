//! Deployment module

pub mod cleanup;
pub mod descriptor;
pub mod docker;
pub mod fsm;
pub mod identifier;
pub mod lock;
pub mod orchestrator;
pub mod proxy;
pub mod runtime;
pub mod template;
