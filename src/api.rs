use serde::Deserialize;

use crate::wg::{Cidr, Key, ParseError};

pub mod http;
pub mod subscriber;

/// Desired state of one peer as declared by the control plane.
///
/// Fields are kept in their wire form and validated on use, so a malformed
/// record only affects itself.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub public_key: String,
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Peer {
    pub fn key(&self) -> Result<Key, ParseError> {
        self.public_key.parse()
    }

    pub fn ipv4_cidr(&self) -> Result<Option<Cidr>, ParseError> {
        parse_family(&self.ipv4, true)
    }

    pub fn ipv6_cidr(&self) -> Result<Option<Cidr>, ParseError> {
        parse_family(&self.ipv6, false)
    }

    /// Addresses the peer owns, IPv4 first. Used as WireGuard allowed IPs.
    pub fn addresses(&self) -> Result<Vec<Cidr>, ParseError> {
        Ok(self
            .ipv4_cidr()?
            .into_iter()
            .chain(self.ipv6_cidr()?)
            .collect())
    }

    /// Ports sorted ascending with duplicates removed.
    pub fn sorted_ports(&self) -> Vec<u16> {
        let mut ports = self.ports.clone();
        ports.sort_unstable();
        ports.dedup();
        ports
    }
}

fn parse_family(s: &str, v4: bool) -> Result<Option<Cidr>, ParseError> {
    if s.trim().is_empty() {
        return Ok(None);
    }

    let cidr: Cidr = s.parse()?;
    if cidr.is_ipv4() != v4 {
        return Err(ParseError::FamilyMismatch(s.to_string()));
    }

    Ok(Some(cidr))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Add,
    Remove,
    UpdatePorts,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Event {
    pub action: Action,
    pub peer: Peer,
}

/// Source of the desired peer list.
pub trait PeerSource {
    type Error: std::fmt::Display;

    async fn get_peers(&self) -> Result<Vec<Peer>, Self::Error>;
    async fn post_connections(&self, keys: &[String]) -> Result<(), Self::Error>;
}
