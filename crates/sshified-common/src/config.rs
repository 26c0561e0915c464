//! Process configuration
//!
//! A single immutable record built from the command line at startup and
//! shared by reference between the proxy handler, the SSH transport and
//! the metrics surface. Reload only ever replaces the SSH credential
//! material, never this record.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// SSH connection settings shared by every destination.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Username used for connecting via ssh.
    pub user: String,
    /// Private key file used for connecting via ssh.
    pub key_file: PathBuf,
    /// Known hosts file used for connecting via ssh.
    pub known_hosts_file: PathBuf,
    /// Port used for connecting via ssh. Global across destinations,
    /// which is why the client pool is keyed by host alone.
    pub port: u16,
}

/// Immutable proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the proxy listens on for inbound requests.
    pub proxy_listen_addr: SocketAddr,
    /// Cascading mode: every upstream dial is redirected to this
    /// `host:port` instead of the requested destination.
    pub next_proxy_addr: Option<String>,
    /// Optional bind address for the `/metrics` listener.
    pub metrics_listen_addr: Option<SocketAddr>,
    /// SSH credentials and endpoint settings.
    pub ssh: SshSettings,
    /// Full roundtrip request timeout. Also drives the transport's idle
    /// timeout and the keepalive probe bound.
    pub request_timeout: Duration,
    /// Upper bound on buffered response bytes; zero or negative disables
    /// buffering entirely and streams responses through.
    pub response_max_bytes: i64,
    /// Reject upstream responses that do not parse as Prometheus
    /// exposition format. Only effective with a positive byte cap.
    pub reject_non_prometheus: bool,
}

impl ProxyConfig {
    /// HTTPS re-origination is only available on the last hop of a
    /// cascading setup; intermediate hops forward the control parameters
    /// untouched.
    pub fn https_enabled(&self) -> bool {
        self.next_proxy_addr.is_none()
    }

    /// Whether responses are buffered (and possibly validated) before
    /// being forwarded.
    pub fn buffering_enabled(&self) -> bool {
        self.response_max_bytes > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> ProxyConfig {
        ProxyConfig {
            proxy_listen_addr: "127.0.0.1:8888".parse().unwrap(),
            next_proxy_addr: None,
            metrics_listen_addr: None,
            ssh: SshSettings {
                user: "scrape".to_string(),
                key_file: "/etc/sshified/id_ed25519".into(),
                known_hosts_file: "/etc/sshified/known_hosts".into(),
                port: 22,
            },
            request_timeout: Duration::from_secs(50),
            response_max_bytes: 0,
            reject_non_prometheus: false,
        }
    }

    #[test]
    fn https_disabled_when_cascading() {
        let mut config = base_config();
        assert!(config.https_enabled());
        config.next_proxy_addr = Some("gw:2222".to_string());
        assert!(!config.https_enabled());
    }

    #[test]
    fn buffering_requires_positive_cap() {
        let mut config = base_config();
        assert!(!config.buffering_enabled());
        config.response_max_bytes = 1;
        assert!(config.buffering_enabled());
        config.response_max_bytes = -1;
        assert!(!config.buffering_enabled());
    }
}
