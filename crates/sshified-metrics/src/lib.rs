//! Prometheus metrics for sshified
//!
//! All counters, gauges and the request histogram live in a single
//! [`Metrics`] registry shared across the proxy handler, the SSH
//! transport and the client pool. The `/metrics` listener is in
//! [`server`].

mod metrics_impl;
pub mod server;

pub use metrics_impl::{ErrorType, Metrics};
pub use server::start_metrics_server;
