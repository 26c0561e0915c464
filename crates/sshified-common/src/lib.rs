//! Shared building blocks for the sshified proxy
//!
//! This crate holds the pieces every other crate needs: the immutable
//! process configuration, `host:port` parsing and the logging
//! bootstrap.

pub mod addr;
pub mod config;
pub mod logging;

pub use config::{ProxyConfig, SshSettings};

/// Version string reported by the binary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
