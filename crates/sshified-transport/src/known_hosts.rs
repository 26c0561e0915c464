//! OpenSSH known-hosts database
//!
//! Strict host-key matching is the only trust model: a destination whose
//! key is absent, changed or revoked never gets a session. The parsed
//! database also answers which host-key algorithms may be advertised for
//! a destination, replacing an interactive "list algorithms" API the SSH
//! layer does not offer.

use std::borrow::Cow;
use std::path::Path;

use data_encoding::BASE64_MIME;
use hmac::{Hmac, Mac};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha1::Sha1;

use crate::error::TransportError;

/// Result of checking a presented host key.
#[derive(Debug, Clone)]
pub enum HostKeyStatus {
    /// Key matches a stored key.
    Known,
    /// No entry for this host.
    Unknown { fingerprint: String },
    /// Key differs from every stored entry for this host.
    Changed {
        old_fingerprint: String,
        new_fingerprint: String,
    },
    /// Key matches a revoked entry.
    Revoked { fingerprint: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    Revoked,
    CertAuthority,
}

#[derive(Debug, Clone)]
struct Entry {
    marker: Option<Marker>,
    hosts_field: String,
    key_type: String,
    key_base64: String,
}

/// Parsed known-hosts database.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<Entry>,
}

impl KnownHosts {
    /// Load and parse a known-hosts file.
    pub fn load(path: &Path) -> Result<Self, TransportError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TransportError::KnownHostsUnreadable(format!("{}: {}", path.display(), e)))?;
        Ok(Self::parse(&content))
    }

    /// Parse known-hosts content. Unparsable lines are skipped, matching
    /// OpenSSH behavior.
    pub fn parse(content: &str) -> Self {
        let mut entries = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (marker, rest) = if let Some(stripped) = trimmed.strip_prefix('@') {
                match stripped.split_once(' ') {
                    Some(("revoked", rest)) => (Some(Marker::Revoked), rest.trim_start()),
                    Some(("cert-authority", rest)) => {
                        (Some(Marker::CertAuthority), rest.trim_start())
                    }
                    _ => continue,
                }
            } else {
                (None, trimmed)
            };

            let mut parts = rest.split_whitespace();
            let (Some(hosts_field), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };

            if russh_keys::parse_public_key_base64(key_data).is_err() {
                tracing::debug!(key_type, "skipping unparsable known_hosts key");
                continue;
            }

            entries.push(Entry {
                marker,
                hosts_field: hosts_field.to_string(),
                key_type: key_type.to_string(),
                key_base64: key_data.to_string(),
            });
        }

        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn matching(&self, host: &str, port: u16) -> impl Iterator<Item = &Entry> + '_ {
        let host_port = host_port_form(host, port).into_owned();
        let host = host.to_string();
        self.entries.iter().filter(move |entry| {
            entry.marker != Some(Marker::CertAuthority)
                && host_matches(&host_port, &host, &entry.hosts_field)
        })
    }

    /// Host-key algorithms accepted for `host:port`, in file order,
    /// deduplicated. Fails when the database has no entry for the host.
    pub fn algorithms_for(&self, host: &str, port: u16) -> Result<Vec<String>, TransportError> {
        let mut algos: Vec<String> = Vec::new();
        for entry in self.matching(host, port) {
            if entry.marker == Some(Marker::Revoked) {
                continue;
            }
            if !algos.iter().any(|a| a == &entry.key_type) {
                algos.push(entry.key_type.clone());
            }
        }
        if algos.is_empty() {
            return Err(TransportError::NoKnownHostsEntry(format!(
                "{}:{}",
                host, port
            )));
        }
        Ok(algos)
    }

    /// Strictly check a presented host key against the database.
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyStatus {
        let presented = key.public_key_base64();
        let fingerprint = key.fingerprint();

        let mut stored_keys = Vec::new();
        for entry in self.matching(host, port) {
            if entry.key_base64 == presented {
                match entry.marker {
                    Some(Marker::Revoked) => return HostKeyStatus::Revoked { fingerprint },
                    _ => return HostKeyStatus::Known,
                }
            }
            if entry.marker.is_none() {
                stored_keys.push(entry);
            }
        }

        match stored_keys.first() {
            None => HostKeyStatus::Unknown { fingerprint },
            Some(entry) => {
                let old_fingerprint = russh_keys::parse_public_key_base64(&entry.key_base64)
                    .map(|k| k.fingerprint())
                    .unwrap_or_default();
                HostKeyStatus::Changed {
                    old_fingerprint,
                    new_fingerprint: fingerprint,
                }
            }
        }
    }
}

/// Replace `ssh-rsa` with the `rsa-sha2-*` signature algorithms.
///
/// known_hosts files record the raw key type, but servers refuse the
/// deprecated `ssh-rsa` signature scheme; the replacements work with the
/// same RSA key material. Order is preserved and the function is
/// idempotent.
pub fn upgrade_host_key_algos(algos: &[String]) -> Vec<String> {
    let mut upgraded = Vec::with_capacity(algos.len());
    for algo in algos {
        if algo == "ssh-rsa" {
            upgraded.push("rsa-sha2-512".to_string());
            upgraded.push("rsa-sha2-256".to_string());
            continue;
        }
        upgraded.push(algo.clone());
    }
    upgraded
}

/// Map algorithm strings onto the names the SSH client can advertise.
/// Unknown algorithms are dropped.
pub(crate) fn preferred_key_names(algos: &[String]) -> Vec<russh_keys::key::Name> {
    use russh_keys::key;
    algos
        .iter()
        .filter_map(|algo| match algo.as_str() {
            "ssh-ed25519" => Some(key::ED25519),
            "ssh-rsa" => Some(key::SSH_RSA),
            "rsa-sha2-256" => Some(key::RSA_SHA2_256),
            "rsa-sha2-512" => Some(key::RSA_SHA2_512),
            "ecdsa-sha2-nistp256" => Some(key::ECDSA_SHA2_NISTP256),
            "ecdsa-sha2-nistp384" => Some(key::ECDSA_SHA2_NISTP384),
            _ => None,
        })
        .collect()
}

/// The lookup form OpenSSH uses: bare host on the default port,
/// `[host]:port` otherwise.
fn host_port_form(host: &str, port: u16) -> Cow<'_, str> {
    if port == 22 {
        Cow::Borrowed(host)
    } else {
        Cow::Owned(format!("[{}]:{}", host, port))
    }
}

fn host_matches(host_port: &str, host: &str, host_field: &str) -> bool {
    let mut matched = false;

    for raw_entry in host_field.split(',') {
        let entry = raw_entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (negated, pattern) = entry
            .strip_prefix('!')
            .map(|p| (true, p))
            .unwrap_or((false, entry));

        let is_match = match_host_pattern(host_port, host, pattern);
        if negated {
            if is_match {
                return false;
            }
            continue;
        }

        if is_match {
            matched = true;
        }
    }

    matched
}

fn match_host_pattern(host_port: &str, host: &str, pattern: &str) -> bool {
    if pattern.starts_with("|1|") {
        return match_hashed_host(host_port, pattern);
    }

    if pattern.contains('*') || pattern.contains('?') {
        return glob_match(pattern, host) || glob_match(pattern, host_port);
    }

    pattern == host || pattern == host_port
}

fn match_hashed_host(host_port: &str, pattern: &str) -> bool {
    let mut parts = pattern.split('|').skip(2);
    let (Some(salt), Some(hash)) = (parts.next(), parts.next()) else {
        return false;
    };

    let (Ok(salt), Ok(hash)) = (
        BASE64_MIME.decode(salt.as_bytes()),
        BASE64_MIME.decode(hash.as_bytes()),
    ) else {
        return false;
    };

    let Ok(mut hmac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    hmac.update(host_port.as_bytes());
    hmac.verify_slice(&hash).is_ok()
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let (mut p_idx, mut t_idx) = (0usize, 0usize);
    let mut star_idx = None;
    let mut match_idx = 0usize;
    let p_bytes = pattern.as_bytes();
    let t_bytes = text.as_bytes();

    while t_idx < t_bytes.len() {
        if p_idx < p_bytes.len() && (p_bytes[p_idx] == b'?' || p_bytes[p_idx] == t_bytes[t_idx]) {
            p_idx += 1;
            t_idx += 1;
            continue;
        }

        if p_idx < p_bytes.len() && p_bytes[p_idx] == b'*' {
            star_idx = Some(p_idx);
            match_idx = t_idx;
            p_idx += 1;
            continue;
        }

        if let Some(star_pos) = star_idx {
            p_idx = star_pos + 1;
            match_idx += 1;
            t_idx = match_idx;
            continue;
        }

        return false;
    }

    while p_idx < p_bytes.len() && p_bytes[p_idx] == b'*' {
        p_idx += 1;
    }

    p_idx == p_bytes.len()
}
