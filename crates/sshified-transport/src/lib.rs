//! SSH-backed connection transport for the sshified proxy
//!
//! The outbound leg of every proxied request is a direct-tcpip channel
//! inside a pooled, authenticated SSH session to the destination host.
//! This crate owns that machinery:
//!
//! - [`pool`]: concurrency-safe `host -> session` cache with safe
//!   concurrent first-use resolution,
//! - [`session`]: tracked sessions that defer teardown until every
//!   tunneled channel has drained,
//! - [`known_hosts`]: strict OpenSSH known-hosts matching and host-key
//!   algorithm selection,
//! - [`credentials`]: reloadable key / known-hosts material,
//! - [`transport`]: the dial state machine (keepalive probe, eviction,
//!   single retry, cascading mode),
//! - [`connector`]: the hyper connector and the two pooled HTTP clients
//!   (strict TLS and skip-verify) sharing one dialer.

pub mod connector;
pub mod credentials;
mod error;
mod handler;
pub mod known_hosts;
pub mod pool;
pub mod session;
pub mod transport;

pub use connector::{build_round_trippers, SshTunnelConnector};
pub use error::TransportError;
pub use known_hosts::{upgrade_host_key_algos, HostKeyStatus, KnownHosts};
pub use session::{ProbeOutcome, TrackedSession, TunnelStream};
pub use transport::SshTransport;
