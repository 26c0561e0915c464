//! The SSH dial state machine
//!
//! `dial` turns a `host:port` target into a tunneled byte stream through
//! a pooled SSH session. A channel-open failure is disambiguated with a
//! bounded liveness probe: a healthy session means the target refused and
//! the error is returned as-is; a dead session is evicted (draining its
//! in-flight channels) and the dial retried once against a fresh session.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::Preferred;
use sshified_common::addr::split_host_port;
use sshified_common::ProxyConfig;
use sshified_metrics::{ErrorType, Metrics};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::credentials::CredentialStore;
use crate::error::TransportError;
use crate::handler::ClientHandler;
use crate::known_hosts::{preferred_key_names, upgrade_host_key_algos};
use crate::pool::SshClientPool;
use crate::session::{ProbeOutcome, TrackedSession, TunnelStream};

pub struct SshTransport {
    ssh_port: u16,
    user: String,
    request_timeout: Duration,
    next_proxy_addr: Option<String>,
    pool: SshClientPool,
    credentials: CredentialStore,
    metrics: Arc<Metrics>,
}

impl SshTransport {
    /// Load credentials and build the transport. Fatal when the key or
    /// known-hosts files are unreadable.
    pub fn new(config: &ProxyConfig, metrics: Arc<Metrics>) -> Result<Self, TransportError> {
        let credentials = CredentialStore::new(
            config.ssh.key_file.clone(),
            config.ssh.known_hosts_file.clone(),
        )?;
        Ok(Self {
            ssh_port: config.ssh.port,
            user: config.ssh.user.clone(),
            request_timeout: config.request_timeout,
            next_proxy_addr: config.next_proxy_addr.clone(),
            pool: SshClientPool::new(Arc::clone(&metrics)),
            credentials,
            metrics,
        })
    }

    /// Re-read key and known-hosts files. Existing pooled sessions stay
    /// untouched; only newly established sessions use the fresh material.
    pub fn reload(&self) -> Result<(), TransportError> {
        self.credentials.reload()
    }

    pub fn pool(&self) -> &SshClientPool {
        &self.pool
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Open a tunneled connection to `addr` (`host:port`).
    ///
    /// In cascading mode every dial is redirected to the configured next
    /// hop; the next hop re-originates the request.
    pub async fn dial(&self, addr: &str) -> Result<TunnelStream, TransportError> {
        let addr = match &self.next_proxy_addr {
            Some(next) => next.as_str(),
            None => addr,
        };
        let (host, port) = split_host_port(addr).map_err(|e| {
            self.metrics.inc_connection_error(ErrorType::AddressParsing);
            TransportError::from(e)
        })?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let session = self.get_ssh_client(&host).await?;

            let open_err = match session.open_tunnel(port).await {
                Ok(stream) => return Ok(stream),
                Err(e) => e,
            };

            debug!(%host, port, err = %open_err, "connection failed, probing session liveness");
            match session.probe_liveness(self.request_timeout / 2).await {
                ProbeOutcome::Healthy => {
                    debug!(%host, "keepalive worked, this is not an ssh conn problem");
                    return Err(open_err);
                }
                outcome => {
                    debug!(%host, ?outcome, "keepalive failed, reconnecting");
                    self.metrics.inc_connection_error(match outcome {
                        ProbeOutcome::TimedOut => ErrorType::SshKeepaliveTimeout,
                        _ => ErrorType::SshKeepaliveFailure,
                    });
                    self.metrics.inc_keepalive_failures();
                    self.pool.remove(&host);
                    if let Err(e) = session.close_when_finished().await {
                        warn!(%host, err = %e, "failed to close dead session");
                    }
                    if attempts >= 2 {
                        return Err(open_err);
                    }
                }
            }
        }
    }

    /// Fetch the pooled session for `host`, establishing one when absent.
    ///
    /// Two concurrent misses both handshake; `set_or_get_cached` decides
    /// the winner and the loser closes its candidate, so the pool never
    /// holds more than one session per host.
    async fn get_ssh_client(&self, host: &str) -> Result<Arc<TrackedSession>, TransportError> {
        let host = host.to_ascii_lowercase();
        if let Some(session) = self.pool.get(&host) {
            trace!(%host, "using cached ssh connection");
            return Ok(session);
        }

        // One snapshot for the whole establishment: key and known-hosts
        // always come from the same reload generation.
        let credentials = self.credentials.snapshot();

        let algos = credentials
            .known_hosts
            .algorithms_for(&host, self.ssh_port)
            .map_err(|e| {
                self.metrics
                    .inc_connection_error(ErrorType::SshHostKeyUnknown);
                e
            })?;
        let upgraded = upgrade_host_key_algos(&algos);
        let key_names = preferred_key_names(&upgraded);
        if key_names.is_empty() {
            self.metrics
                .inc_connection_error(ErrorType::SshHostKeyUnknown);
            return Err(TransportError::NoUsableHostKeyAlgorithm(host));
        }

        let ssh_addr = format!("{}:{}", host, self.ssh_port);
        trace!(%host, algos = ?upgraded, "building ssh connection");

        let ssh_config = Arc::new(client::Config {
            preferred: Preferred {
                key: Cow::Owned(key_names),
                ..Preferred::DEFAULT
            },
            ..Default::default()
        });
        let handler = ClientHandler::new(
            host.clone(),
            self.ssh_port,
            Arc::clone(&credentials.known_hosts),
        );

        let user = self.user.clone();
        let key = Arc::clone(&credentials.key);
        let established = timeout(self.request_timeout, async move {
            let mut handle = client::connect(ssh_config, ssh_addr.as_str(), handler).await?;
            let authenticated = handle.authenticate_publickey(user, key).await?;
            if !authenticated {
                return Err(TransportError::AuthenticationFailed(ssh_addr));
            }
            Ok(handle)
        })
        .await;

        let handle = match established {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                self.metrics.inc_connection_error(ErrorType::SshConnection);
                return Err(e);
            }
            Err(_) => {
                self.metrics.inc_connection_error(ErrorType::SshConnection);
                return Err(TransportError::HandshakeTimeout(format!(
                    "{}:{}",
                    host, self.ssh_port
                )));
            }
        };

        let candidate = TrackedSession::new(handle, host.clone());
        match self.pool.set_or_get_cached(&host, Arc::clone(&candidate)) {
            Some(winner) => {
                // Concurrent requests raced us to the pool; drop our
                // freshly created session and use the cached one instead.
                debug!(%host, "discarding duplicate ssh connection");
                if let Err(e) = candidate.close().await {
                    warn!(%host, err = %e, "failed to close duplicate session");
                }
                Ok(winner)
            }
            None => {
                trace!(%host, "caching successful ssh connection");
                Ok(candidate)
            }
        }
    }
}
