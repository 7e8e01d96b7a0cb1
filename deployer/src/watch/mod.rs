//! Filesystem watching

pub mod debounce;
pub mod filter;
pub mod source;
