//! `host:port` parsing for dial targets

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid address format")]
    InvalidFormat,
    #[error("invalid port number")]
    InvalidPort,
}

/// Split an address of the form `host:port` into its parts.
///
/// The split happens at the final colon so that bracketed IPv6 literals
/// (`[::1]:9090`) are handled; an unbracketed IPv6 literal is rejected as
/// ambiguous, matching the standard library's `host:port` splitters.
pub fn split_host_port(addr: &str) -> Result<(String, u16), AddrError> {
    let idx = addr.rfind(':').ok_or(AddrError::InvalidFormat)?;
    let (host, port) = (&addr[..idx], &addr[idx + 1..]);

    let host = if let Some(inner) = host.strip_prefix('[') {
        inner.strip_suffix(']').ok_or(AddrError::InvalidFormat)?
    } else if host.contains(':') || host.contains(']') {
        return Err(AddrError::InvalidFormat);
    } else {
        host
    };
    if host.is_empty() {
        return Err(AddrError::InvalidFormat);
    }

    let port: u16 = port.parse().map_err(|_| AddrError::InvalidPort)?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_port() {
        assert_eq!(
            split_host_port("node1.example.com:9090").unwrap(),
            ("node1.example.com".to_string(), 9090)
        );
    }

    #[test]
    fn splits_bracketed_ipv6() {
        assert_eq!(
            split_host_port("[2001:db8::1]:443").unwrap(),
            ("2001:db8::1".to_string(), 443)
        );
    }

    #[test]
    fn rejects_missing_port() {
        assert_eq!(
            split_host_port("node1.example.com").unwrap_err(),
            AddrError::InvalidFormat
        );
    }

    #[test]
    fn rejects_unbracketed_ipv6() {
        assert_eq!(
            split_host_port("2001:db8::1:443").unwrap_err(),
            AddrError::InvalidFormat
        );
    }

    #[test]
    fn rejects_empty_host() {
        assert_eq!(split_host_port(":80").unwrap_err(), AddrError::InvalidFormat);
    }

    #[test]
    fn rejects_bad_port() {
        assert_eq!(
            split_host_port("host:http").unwrap_err(),
            AddrError::InvalidPort
        );
        assert_eq!(
            split_host_port("host:99999").unwrap_err(),
            AddrError::InvalidPort
        );
        assert_eq!(split_host_port("host:").unwrap_err(), AddrError::InvalidPort);
    }
}
