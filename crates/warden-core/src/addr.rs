use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// A `host:port` pair identifying an RPC listener or a worker socket.
///
/// Hosts are typically dotted-decimal IPv4 (`0.0.0.0`, `10.0.1.7`) but
/// hostnames are accepted and resolved at connect time. Ports are 16-bit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let Some((host, port)) = s.rsplit_once(':') else {
            bail!("Address '{}' is missing a ':port' suffix", s);
        };
        if host.is_empty() {
            bail!("Address '{}' has an empty host", s);
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("Address '{}' has an invalid port", s))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ServerAddress> for String {
    fn from(addr: ServerAddress) -> String {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr: ServerAddress = "0.0.0.0:3334".parse().unwrap();
        assert_eq!(addr.host(), "0.0.0.0");
        assert_eq!(addr.port(), 3334);
        assert_eq!(addr, ServerAddress::new("0.0.0.0", 3334));
    }

    #[test]
    fn test_parse_hostname() {
        let addr: ServerAddress = "gpu-host-07:4000".parse().unwrap();
        assert_eq!(addr.host(), "gpu-host-07");
        assert_eq!(addr.port(), 4000);
    }

    #[test]
    fn test_display_roundtrip() {
        let addr: ServerAddress = "10.0.1.7:3335".parse().unwrap();
        assert_eq!(addr.to_string(), "10.0.1.7:3335");
    }

    #[test]
    fn test_missing_port_rejected() {
        assert!("10.0.1.7".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn test_empty_host_rejected() {
        assert!(":4000".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn test_port_out_of_range_rejected() {
        assert!("0.0.0.0:70000".parse::<ServerAddress>().is_err());
    }
}
