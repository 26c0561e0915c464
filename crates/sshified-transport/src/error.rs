//! Transport error types

use sshified_common::addr::AddrError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("network type {0} is not supported")]
    UnsupportedNetwork(String),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error("unable to read private key file {0}")]
    KeyFileUnreadable(String),

    #[error("unable to parse private key file {0}")]
    KeyFileUnparsable(String),

    #[error("failed to load known hosts: {0}")]
    KnownHostsUnreadable(String),

    #[error("no matching known hosts entry for {0}")]
    NoKnownHostsEntry(String),

    #[error("no usable host key algorithm for {0}")]
    NoUsableHostKeyAlgorithm(String),

    #[error("ssh handshake with {0} timed out")]
    HandshakeTimeout(String),

    #[error("ssh authentication failed for {0}")]
    AuthenticationFailed(String),

    #[error("session is closing")]
    SessionClosing,

    #[error("failed to obtain ssh connection: {0}")]
    Connect(String),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
}
