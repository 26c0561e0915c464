//! Test harness for sshified integration tests
//!
//! Provides an in-process SSH server speaking real russh, forwarding
//! direct-tcpip channels to local TCP targets, plus a minimal HTTP
//! target server to tunnel to.

mod http_target;
mod ssh_server;

pub use http_target::HttpTarget;
pub use ssh_server::{MockSshd, MockSshdConfig};
