//! Bind and destination addresses.
//!
//! Both are kept as `host` + `port` rather than `SocketAddr` so that
//! hostnames are resolved at bind/connect time.

use std::fmt;
use std::str::FromStr;

use crate::error::ProxyError;

/// Address the proxy listens on. Port 0 requests an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindAddress {
    host: String,
    port: u16,
}

impl BindAddress {
    /// Create a bind address.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ProxyError> {
        let host = normalize_host(host.into())?;
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_host_port(f, &self.host, self.port)
    }
}

impl FromStr for BindAddress {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s)?;
        Self::new(host, port)
    }
}

/// The single upstream every accepted connection is relayed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
}

impl Destination {
    /// Create a destination. The port must be in 1..=65535.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ProxyError> {
        let host = host.into();
        if port == 0 {
            return Err(ProxyError::invalid_address(
                format!("{host}:0"),
                "destination port must be between 1 and 65535",
            ));
        }
        let host = normalize_host(host)?;
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_host_port(f, &self.host, self.port)
    }
}

impl FromStr for Destination {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s)?;
        Self::new(host, port)
    }
}

fn normalize_host(host: String) -> Result<String, ProxyError> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(ProxyError::invalid_address(host, "host must not be empty"));
    }
    // Brackets are only part of the textual form.
    let unbracketed = trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(trimmed);
    Ok(unbracketed.to_string())
}

fn split_host_port(s: &str) -> Result<(&str, u16), ProxyError> {
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let Some((host, port)) = rest.split_once("]:") else {
            return Err(ProxyError::invalid_address(s, "expected [host]:port"));
        };
        (host, port)
    } else {
        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(ProxyError::invalid_address(s, "expected host:port"));
        };
        if host.contains(':') {
            return Err(ProxyError::invalid_address(
                s,
                "IPv6 hosts must be written as [host]:port",
            ));
        }
        (host, port)
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| ProxyError::invalid_address(s, "port must be an integer 0-65535"))?;
    Ok((host, port))
}

fn write_host_port(f: &mut fmt::Formatter<'_>, host: &str, port: u16) -> fmt::Result {
    if host.contains(':') {
        write!(f, "[{host}]:{port}")
    } else {
        write!(f, "{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_destination() {
        let dest: Destination = "127.0.0.1:9002".parse().unwrap();
        assert_eq!(dest.host(), "127.0.0.1");
        assert_eq!(dest.port(), 9002);
        assert_eq!(dest.to_string(), "127.0.0.1:9002");
    }

    #[test]
    fn test_parse_ipv6_destination() {
        let dest: Destination = "[::1]:443".parse().unwrap();
        assert_eq!(dest.host(), "::1");
        assert_eq!(dest.to_string(), "[::1]:443");
    }

    #[test]
    fn test_destination_rejects_port_zero() {
        let err = Destination::new("localhost", 0).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidAddress { .. }));
        assert!("localhost:0".parse::<Destination>().is_err());
    }

    #[test]
    fn test_bind_address_allows_ephemeral_port() {
        let bind: BindAddress = "127.0.0.1:0".parse().unwrap();
        assert_eq!(bind.port(), 0);
    }

    #[test]
    fn test_rejects_malformed_addresses() {
        assert!("localhost".parse::<Destination>().is_err());
        assert!(":8080".parse::<Destination>().is_err());
        assert!("::1:8080".parse::<BindAddress>().is_err());
        assert!("host:http".parse::<BindAddress>().is_err());
        assert!("host:70000".parse::<BindAddress>().is_err());
    }

    #[test]
    fn test_bracketed_host_is_normalized() {
        let bind = BindAddress::new("[::1]", 8080).unwrap();
        assert_eq!(bind.host(), "::1");
        assert_eq!(bind.to_string(), "[::1]:8080");
    }
}
