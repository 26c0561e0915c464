//! Inbound proxy surface for sshified
//!
//! Receives plain (non-absolute) HTTP proxy requests, rebuilds them as
//! upstream requests targeting the inbound `Host` header, executes them
//! over the SSH-tunneled round-trippers and forwards the response —
//! optionally buffered, capped, gunzipped and validated as Prometheus
//! exposition data.

mod body;
pub mod handler;
pub mod server;
pub mod validate;

pub use handler::ProxyState;
pub use server::start_proxy_server;
