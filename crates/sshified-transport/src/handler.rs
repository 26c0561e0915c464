//! russh client handler with strict known-hosts verification

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;
use tracing::warn;

use crate::error::TransportError;
use crate::known_hosts::{HostKeyStatus, KnownHosts};

/// Client handler for russh. Holds the known-hosts snapshot taken when
/// session establishment began.
pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    known_hosts: Arc<KnownHosts>,
}

impl ClientHandler {
    pub(crate) fn new(host: String, port: u16, known_hosts: Arc<KnownHosts>) -> Self {
        Self {
            host,
            port,
            known_hosts,
        }
    }
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self
            .known_hosts
            .verify(&self.host, self.port, server_public_key)
        {
            HostKeyStatus::Known => Ok(true),
            HostKeyStatus::Unknown { fingerprint } => {
                warn!(host = %self.host, port = self.port, %fingerprint,
                    "host key not found in known hosts");
                Ok(false)
            }
            HostKeyStatus::Changed {
                old_fingerprint,
                new_fingerprint,
            } => {
                warn!(host = %self.host, port = self.port, %old_fingerprint, %new_fingerprint,
                    "host key changed");
                Ok(false)
            }
            HostKeyStatus::Revoked { fingerprint } => {
                warn!(host = %self.host, port = self.port, %fingerprint, "host key revoked");
                Ok(false)
            }
        }
    }
}
