use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::GatewayError;

/// Socket family the gateway listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenNetwork {
    /// TCP over whichever IP family the address resolves to.
    Tcp,
    /// TCP restricted to IPv4.
    Tcp4,
    /// TCP restricted to IPv6.
    Tcp6,
    /// Unix domain socket, the address is a filesystem path.
    Unix,
}

impl ListenNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenNetwork::Tcp => "tcp",
            ListenNetwork::Tcp4 => "tcp4",
            ListenNetwork::Tcp6 => "tcp6",
            ListenNetwork::Unix => "unix",
        }
    }
}

impl FromStr for ListenNetwork {
    type Err = GatewayError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(ListenNetwork::Tcp),
            "tcp4" => Ok(ListenNetwork::Tcp4),
            "tcp6" => Ok(ListenNetwork::Tcp6),
            "unix" => Ok(ListenNetwork::Unix),
            _ => Err(GatewayError::UnsupportedNetwork(value.to_string())),
        }
    }
}

impl fmt::Display for ListenNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    pub network: ListenNetwork,
    pub address: String,
}

impl ListenAddress {
    pub fn new(network: ListenNetwork, address: impl Into<String>) -> Self {
        Self {
            network,
            address: address.into(),
        }
    }

    pub fn tcp(address: impl Into<String>) -> Self {
        Self::new(ListenNetwork::Tcp, address)
    }

    pub fn unix(path: impl Into<String>) -> Self {
        Self::new(ListenNetwork::Unix, path)
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}

/// PEM files used to secure the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    /// When set, callers must present a certificate signed by this CA.
    pub client_ca: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSecurity {
    Insecure,
    Tls(TlsPaths),
}

impl fmt::Display for TransportSecurity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSecurity::Insecure => f.write_str("insecure"),
            TransportSecurity::Tls(TlsPaths {
                client_ca: None, ..
            }) => f.write_str("tls"),
            TransportSecurity::Tls(_) => f.write_str("mutual-tls"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub listen: ListenAddress,
    pub security: TransportSecurity,
}

impl GatewayConfig {
    pub fn new(listen: ListenAddress, security: TransportSecurity) -> Self {
        Self { listen, security }
    }

    pub fn insecure(listen: ListenAddress) -> Self {
        Self::new(listen, TransportSecurity::Insecure)
    }
}
