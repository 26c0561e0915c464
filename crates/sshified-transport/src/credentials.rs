//! Reloadable SSH credential material
//!
//! The private key and known-hosts database are read at startup and
//! re-read on SIGHUP. Both live behind one `Arc` so a reader always sees
//! a matching pair; `get_ssh_client` snapshots the Arc once at entry.
//! Existing pooled sessions are never invalidated by a reload, so rotated
//! credentials only take effect on newly established sessions.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use russh_keys::key::KeyPair;

use crate::error::TransportError;
use crate::known_hosts::KnownHosts;

/// One consistent snapshot of key plus known-hosts.
#[derive(Debug)]
pub struct SshCredentials {
    pub key: Arc<KeyPair>,
    pub known_hosts: Arc<KnownHosts>,
}

impl SshCredentials {
    pub fn load(key_file: &Path, known_hosts_file: &Path) -> Result<Self, TransportError> {
        let key_data = std::fs::read_to_string(key_file)
            .map_err(|_| TransportError::KeyFileUnreadable(key_file.display().to_string()))?;
        let key = russh_keys::decode_secret_key(&key_data, None)
            .map_err(|_| TransportError::KeyFileUnparsable(key_file.display().to_string()))?;
        let known_hosts = KnownHosts::load(known_hosts_file)?;
        Ok(Self {
            key: Arc::new(key),
            known_hosts: Arc::new(known_hosts),
        })
    }
}

/// Credential store with atomic swap on reload.
#[derive(Debug)]
pub struct CredentialStore {
    key_file: PathBuf,
    known_hosts_file: PathBuf,
    current: RwLock<Arc<SshCredentials>>,
}

impl CredentialStore {
    pub fn new(key_file: PathBuf, known_hosts_file: PathBuf) -> Result<Self, TransportError> {
        let credentials = SshCredentials::load(&key_file, &known_hosts_file)?;
        Ok(Self {
            key_file,
            known_hosts_file,
            current: RwLock::new(Arc::new(credentials)),
        })
    }

    /// Current snapshot. Callers hold the returned Arc for the whole
    /// session establishment so a concurrent reload cannot mix old and
    /// new material.
    pub fn snapshot(&self) -> Arc<SshCredentials> {
        Arc::clone(&self.current.read().expect("credential lock poisoned"))
    }

    /// Re-read key and known-hosts files. On error the previous
    /// credentials remain in force.
    pub fn reload(&self) -> Result<(), TransportError> {
        let fresh = SshCredentials::load(&self.key_file, &self.known_hosts_file)?;
        *self.current.write().expect("credential lock poisoned") = Arc::new(fresh);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh_keys::PublicKeyBase64;
    use std::io::Write;

    fn write_key_and_hosts() -> (tempfile::NamedTempFile, tempfile::NamedTempFile, KeyPair) {
        let key = KeyPair::generate_ed25519().unwrap();
        let mut key_file = tempfile::NamedTempFile::new().unwrap();
        write_openssh_key(&key, key_file.as_file_mut());

        let public = key.clone_public_key().unwrap();
        let mut hosts_file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            hosts_file,
            "node1 {} {}",
            public.name(),
            public.public_key_base64()
        )
        .unwrap();

        (key_file, hosts_file, key)
    }

    fn write_openssh_key(key: &KeyPair, out: &mut std::fs::File) {
        let mut buf = Vec::new();
        russh_keys::encode_pkcs8_pem(key, &mut buf).unwrap();
        out.write_all(&buf).unwrap();
    }

    #[test]
    fn load_and_snapshot() {
        let (key_file, hosts_file, _key) = write_key_and_hosts();
        let store =
            CredentialStore::new(key_file.path().into(), hosts_file.path().into()).unwrap();
        let snap = store.snapshot();
        assert!(snap.known_hosts.algorithms_for("node1", 22).is_ok());
    }

    #[test]
    fn reload_swaps_known_hosts() {
        let (key_file, hosts_file, key) = write_key_and_hosts();
        let store =
            CredentialStore::new(key_file.path().into(), hosts_file.path().into()).unwrap();

        let public = key.clone_public_key().unwrap();
        std::fs::write(
            hosts_file.path(),
            format!("node2 {} {}\n", public.name(), public.public_key_base64()),
        )
        .unwrap();
        store.reload().unwrap();

        let snap = store.snapshot();
        assert!(snap.known_hosts.algorithms_for("node1", 22).is_err());
        assert!(snap.known_hosts.algorithms_for("node2", 22).is_ok());
    }

    #[test]
    fn reload_failure_keeps_previous() {
        let (key_file, hosts_file, _key) = write_key_and_hosts();
        let store =
            CredentialStore::new(key_file.path().into(), hosts_file.path().into()).unwrap();

        std::fs::write(key_file.path(), "not a key").unwrap();
        assert!(store.reload().is_err());
        let snap = store.snapshot();
        assert!(snap.known_hosts.algorithms_for("node1", 22).is_ok());
    }

    #[test]
    fn unreadable_key_is_a_config_error() {
        let (_key_file, hosts_file, _key) = write_key_and_hosts();
        let err = CredentialStore::new("/does/not/exist".into(), hosts_file.path().into())
            .unwrap_err();
        assert!(matches!(err, TransportError::KeyFileUnreadable(_)));
    }
}
