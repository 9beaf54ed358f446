//! Parser for the tab separated output of `wg show <iface> dump`.
//!
//! The first line describes the interface itself and is skipped, every
//! following line describes one peer:
//!
//! ```text
//! public-key preshared-key endpoint allowed-ips latest-handshake transfer-rx transfer-tx persistent-keepalive
//! ```

use std::{
    net::AddrParseError,
    num::ParseIntError,
    time::{Duration, SystemTime},
};

use super::{Cidr, peer::WgPeerInfo};

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("key decode error: {0}")]
    KeyDecodeError(#[from] base64::DecodeError),

    #[error("key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("addr parse error: {0}")]
    AddrParseError(#[from] AddrParseError),

    #[error("int parse error: {0}")]
    ParseIntError(#[from] ParseIntError),

    #[error("invalid prefix length: {0}")]
    InvalidPrefix(u8),

    #[error("address family mismatch: {0}")]
    FamilyMismatch(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

const NONE: &str = "(none)";

pub fn parse_dump(input: &str) -> Result<Vec<WgPeerInfo>, ParseError> {
    input
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(parse_peer_line)
        .collect()
}

fn parse_peer_line(line: &str) -> Result<WgPeerInfo, ParseError> {
    let mut fields = line.split('\t');
    let mut next = |name: &'static str| fields.next().ok_or(ParseError::MissingField(name));

    let public_key = next("public-key")?.parse()?;
    let _preshared_key = next("preshared-key")?;
    let _endpoint = next("endpoint")?;
    let allowed_ips = parse_allowed_ips(next("allowed-ips")?)?;
    let latest_handshake = match next("latest-handshake")?.parse::<u64>()? {
        0 => None,
        secs => Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)),
    };
    let rx = next("transfer-rx")?.parse()?;
    let tx = next("transfer-tx")?.parse()?;
    match next("persistent-keepalive")? {
        "off" => {}
        secs => {
            secs.parse::<u32>()?;
        }
    }

    Ok(WgPeerInfo {
        public_key,
        allowed_ips,
        latest_handshake,
        transfer: (rx, tx),
    })
}

fn parse_allowed_ips(s: &str) -> Result<Vec<Cidr>, ParseError> {
    if s == NONE || s.is_empty() {
        return Ok(Vec::new());
    }

    s.split(',').map(str::parse).collect()
}
