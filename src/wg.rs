use base64::prelude::*;
use std::{
    net::{IpAddr, Ipv4Addr},
    str::FromStr,
};

pub mod cmd;
pub mod dump;
#[cfg(test)]
pub mod fake;
pub mod manager;
pub mod peer;

pub use dump::ParseError;
pub use manager::Wireguard;
use peer::WgPeerInfo;

pub const KEY_LENGTH: usize = 32;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key([u8; KEY_LENGTH]);

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Key {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64_STANDARD.decode(s.trim())?;
        let inner: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| ParseError::KeyLength(b.len()))?;

        Ok(Key(inner))
    }
}

impl From<[u8; KEY_LENGTH]> for Key {
    fn from(v: [u8; KEY_LENGTH]) -> Self {
        Key(v)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cidr {
    pub ip: IpAddr,
    pub mask: u8,
}

impl Cidr {
    pub fn new(ip: IpAddr, mask: u8) -> Result<Self, ParseError> {
        if mask > max_mask(&ip) {
            return Err(ParseError::InvalidPrefix(mask));
        }

        Ok(Cidr { ip, mask })
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }
}

fn max_mask(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl Default for Cidr {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mask: 0,
        }
    }
}

impl FromStr for Cidr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, mask) = s.split_once('/').unwrap_or((s, ""));
        let ip: IpAddr = ip.trim().parse()?;
        let mask = mask.trim();

        let mask: u8 = if !mask.is_empty() {
            mask.parse()?
        } else {
            max_mask(&ip)
        };

        Cidr::new(ip, mask)
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.mask)
    }
}

/// Access to the kernel peer table of WireGuard interfaces.
pub trait WireguardApi {
    type Error: std::fmt::Display;

    fn get_peers(&self, iface: &str) -> Result<Vec<WgPeerInfo>, Self::Error>;

    /// Creates the peer if missing, otherwise replaces its allowed IPs.
    fn set_peer(
        &mut self,
        iface: &str,
        key: &Key,
        allowed_ips: &[Cidr],
    ) -> Result<(), Self::Error>;

    fn remove_peer(&mut self, iface: &str, key: &Key) -> Result<(), Self::Error>;
}
