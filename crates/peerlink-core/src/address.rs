//! Network target addresses.

use std::{fmt, net::SocketAddr, str::FromStr};

use crate::error::AddressError;

/// Host and port of a peer endpoint.
///
/// Parsed from `host:port`, with IPv6 literals written as `[::1]:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkHostAndPort {
    host: String,
    port: u16,
}

impl NetworkHostAndPort {
    /// Create an address from its parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Host name or IP literal, without brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl From<SocketAddr> for NetworkHostAndPort {
    fn from(addr: SocketAddr) -> Self {
        Self { host: addr.ip().to_string(), port: addr.port() }
    }
}

impl FromStr for NetworkHostAndPort {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, port) =
                rest.split_once("]:").ok_or_else(|| AddressError::MissingPort(s.to_string()))?;
            (host, port)
        } else {
            s.rsplit_once(':').ok_or_else(|| AddressError::MissingPort(s.to_string()))?
        };

        if host.is_empty() {
            return Err(AddressError::MissingHost(s.to_string()));
        }
        let port = port.parse().map_err(|_| AddressError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NetworkHostAndPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
