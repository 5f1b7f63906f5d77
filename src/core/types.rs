use std::fmt;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use super::{Error, Result};
use crate::util::{duration_to_ticks, space_padded, trim_field};

/// Identifies a bound link by its remote UDP endpoint
///
/// IPv4 senders are stored as IPv4-mapped IPv6 addresses, so a peer reaching
/// a dual-stack socket through either family maps onto the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    /// Remote address, always in IPv6 form
    pub ip: Ipv6Addr,
    /// Remote UDP port
    pub port: u16,
}

impl From<SocketAddr> for PeerKey {
    fn from(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        PeerKey { ip, port: addr.port() }
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]:{}", self.ip, self.port)
    }
}

/// An 8-character, space padded D-Star callsign field
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Callsign(pub [u8; 8]);

impl Callsign {
    /// Builds a callsign from text, padding or truncating to 8 characters
    pub fn new(text: &str) -> Self {
        Callsign(space_padded(text))
    }

    /// Copies a callsign from the first 8 bytes of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut field = [b' '; 8];
        let len = bytes.len().min(8);
        field[..len].copy_from_slice(&bytes[..len]);
        Callsign(field)
    }

    /// Returns the raw padded bytes
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&trim_field(&self.0))
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callsign({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// Where a session's link handle connects to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEndpoint {
    /// TCP stream to a host and port
    Tcp { host: String, port: u16 },
    /// Unix-domain stream socket
    Unix(PathBuf),
}

/// Configuration for the DExtra gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local address the reflector socket binds to
    pub bind_addr: SocketAddr,
    /// Link address: host name or IP for TCP, socket path when `link_port` is 0
    pub link_addr: String,
    /// Link port, 0 selects a Unix-domain socket
    pub link_port: u16,
    /// Reflector name sent in keepalives, at most 8 characters
    pub reflector_name: String,
    /// Interval between keepalives sent to each peer
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub keepalive_interval: Duration,
    /// Silence after which a peer is considered dead
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub dead_interval: Duration,
    /// Consecutive receive errors tolerated before the server gives up
    pub error_budget: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), super::DEFAULT_PORT),
            link_addr: super::DEFAULT_LINK_ADDR.to_string(),
            link_port: super::DEFAULT_LINK_PORT,
            reflector_name: "XRFSGW".to_string(),
            keepalive_interval: Duration::from_secs(10),
            dead_interval: Duration::from_secs(35),
            error_budget: 10,
        }
    }
}

impl Config {
    /// Checks that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.reflector_name.len() > 8 {
            return Err(Error::config(format!(
                "Reflector name '{}' exceeds 8 characters",
                self.reflector_name
            )));
        }
        if self.keepalive_interval.as_secs() == 0 || self.dead_interval.as_secs() == 0 {
            return Err(Error::config("Intervals must be at least one second"));
        }
        if self.keepalive_interval >= self.dead_interval {
            return Err(Error::config("Keepalive interval must be shorter than the dead interval"));
        }
        if self.link_port != 0 && self.link_addr.is_empty() {
            return Err(Error::config("Link address is required for TCP links"));
        }
        Ok(())
    }

    /// Resolves the link endpoint, falling back to the default socket path in Unix mode
    pub fn link_endpoint(&self) -> LinkEndpoint {
        if self.link_port == 0 {
            let path = if self.link_addr.is_empty() || self.link_addr == super::DEFAULT_LINK_ADDR {
                super::DEFAULT_LINK_SOCKET
            } else {
                self.link_addr.as_str()
            };
            LinkEndpoint::Unix(PathBuf::from(path))
        } else {
            LinkEndpoint::Tcp {
                host: self.link_addr.clone(),
                port: self.link_port,
            }
        }
    }

    /// The 9-byte keepalive datagram: padded reflector name and a NUL
    pub fn keepalive_payload(&self) -> [u8; 9] {
        let mut payload = [0u8; 9];
        payload[..8].copy_from_slice(&space_padded::<8>(&self.reflector_name));
        payload
    }

    /// Keepalive interval in supervisor ticks
    pub fn keepalive_ticks(&self) -> u32 {
        duration_to_ticks(self.keepalive_interval)
    }

    /// Dead interval in supervisor ticks
    pub fn dead_ticks(&self) -> u32 {
        duration_to_ticks(self.dead_interval)
    }
}
