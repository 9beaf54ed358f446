use std::time::{Duration, SystemTime};

use super::{Cidr, Key};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgPeerInfo {
    // PublicKey
    pub public_key: Key,

    // AllowedIPs
    pub allowed_ips: Vec<Cidr>,

    // LatestHandshake, None when the peer never completed one
    pub latest_handshake: Option<SystemTime>,

    // Transfer (rx, tx)
    pub transfer: (u64, u64),
}

impl WgPeerInfo {
    /// A handshake in the future (clock skew) still counts as recent.
    pub fn handshake_within(&self, now: SystemTime, max_age: Duration) -> bool {
        match self.latest_handshake {
            Some(at) => now.duration_since(at).map_or(true, |age| age <= max_age),
            None => false,
        }
    }

    pub fn has_allowed_ips(&self, allowed_ips: &[Cidr]) -> bool {
        let mut current = self.allowed_ips.clone();
        let mut wanted = allowed_ips.to_vec();
        current.sort();
        current.dedup();
        wanted.sort();
        wanted.dedup();

        current == wanted
    }
}
