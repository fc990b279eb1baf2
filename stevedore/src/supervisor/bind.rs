//! Listen address (`host:port`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use stevedore_shared::StevedoreError;
use stevedore_shared::constants::network;

/// Address the master listens on. Port 0 asks the kernel for a free port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BindAddress(SocketAddr);

impl BindAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl Default for BindAddress {
    fn default() -> Self {
        Self(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            network::DEFAULT_PORT,
        ))
    }
}

impl FromStr for BindAddress {
    type Err = StevedoreError;

    /// Accepts `host:port`, `[v6]:port`, a bare `:port`, or a bare host
    /// (default port).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StevedoreError::InvalidArgument(format!("invalid bind address '{s}'"));

        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self(addr));
        }
        if let Some(port) = s.strip_prefix(':') {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            return Ok(Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)));
        }
        if let Ok(ip) = s.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            return Ok(Self(SocketAddr::new(ip, network::DEFAULT_PORT)));
        }
        if let Some((host, port)) = s.rsplit_once(':')
            && host == "localhost"
        {
            let port = port.parse::<u16>().map_err(|_| invalid())?;
            return Ok(Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)));
        }
        Err(invalid())
    }
}

impl TryFrom<String> for BindAddress {
    type Error = StevedoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BindAddress> for String {
    fn from(value: BindAddress) -> Self {
        value.to_string()
    }
}

impl fmt::Display for BindAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_all_interfaces_8000() {
        assert_eq!(BindAddress::default().to_string(), "0.0.0.0:8000");
    }

    #[rstest]
    #[case("0.0.0.0:8000", "0.0.0.0:8000")]
    #[case("127.0.0.1:0", "127.0.0.1:0")]
    #[case(":9000", "0.0.0.0:9000")]
    #[case("127.0.0.1", "127.0.0.1:8000")]
    #[case("[::1]:8080", "[::1]:8080")]
    #[case("localhost:7000", "127.0.0.1:7000")]
    fn test_parse(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(input.parse::<BindAddress>().unwrap().to_string(), expected);
    }

    #[rstest]
    #[case("example.com:80")]
    #[case("0.0.0.0:99999")]
    #[case("")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(input.parse::<BindAddress>().is_err());
    }
}
