use std::{
    collections::{BTreeMap, BTreeSet},
    time::{Duration, SystemTime},
};

use metrics::{counter, gauge};

use crate::{api::Peer, error::Error, scheduler::PeerManager};

use super::{Cidr, Key, WireguardApi};

/// Peers whose latest handshake is older than this are not reported as
/// connected. Matches WireGuard's reject-after-time.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(180);

/// Owns the peer table of every configured WireGuard interface.
pub struct Wireguard<B> {
    backend: B,
    interfaces: Vec<String>,
}

impl<B: WireguardApi> Wireguard<B> {
    pub fn new(backend: B, interfaces: Vec<String>) -> Result<Self, Error> {
        if interfaces.is_empty() {
            return Err(Error::Config("no wireguard interfaces configured".into()));
        }

        for iface in &interfaces {
            backend
                .get_peers(iface)
                .map_err(|err| Error::InterfaceUnavailable {
                    iface: iface.clone(),
                    reason: err.to_string(),
                })?;
        }

        Ok(Self {
            backend,
            interfaces,
        })
    }

    pub fn add_peer(&mut self, peer: &Peer) {
        let Some((key, allowed_ips)) = parse_peer(peer) else {
            return;
        };

        for iface in &self.interfaces {
            set_peer(&mut self.backend, iface, &key, &allowed_ips);
        }
    }

    pub fn remove_peer(&mut self, peer: &Peer) {
        let key = match peer.key() {
            Ok(key) => key,
            Err(err) => {
                invalid_peer(peer, err);
                return;
            }
        };

        for iface in &self.interfaces {
            remove_peer(&mut self.backend, iface, &key);
        }
    }

    /// Brings every interface in line with `peers` and returns the keys of
    /// desired peers that completed a handshake recently.
    pub fn update_peers(&mut self, peers: &[Peer]) -> Vec<String> {
        let desired: BTreeMap<Key, Vec<Cidr>> = peers.iter().filter_map(parse_peer).collect();
        let now = SystemTime::now();
        let mut connected = BTreeSet::new();

        for iface in &self.interfaces {
            let current = match self.backend.get_peers(iface) {
                Ok(current) => current,
                Err(err) => {
                    log::error!("error listing peers on {iface}: {err}");
                    counter!("wireguard.errors", "op" => "list").increment(1);
                    continue;
                }
            };

            let (mut added, mut removed, mut updated) = (0usize, 0usize, 0usize);
            let (mut rx, mut tx) = (0u64, 0u64);
            let mut present = BTreeSet::new();

            for info in &current {
                rx = rx.saturating_add(info.transfer.0);
                tx = tx.saturating_add(info.transfer.1);

                let Some(allowed_ips) = desired.get(&info.public_key) else {
                    if remove_peer(&mut self.backend, iface, &info.public_key) {
                        removed += 1;
                    }
                    continue;
                };

                present.insert(info.public_key);

                // Only rewrite peers that changed, re-adding resets their counters.
                if !info.has_allowed_ips(allowed_ips)
                    && set_peer(&mut self.backend, iface, &info.public_key, allowed_ips)
                {
                    updated += 1;
                }

                if info.handshake_within(now, HANDSHAKE_TIMEOUT) {
                    connected.insert(info.public_key);
                }
            }

            for (key, allowed_ips) in &desired {
                if !present.contains(key) && set_peer(&mut self.backend, iface, key, allowed_ips) {
                    added += 1;
                }
            }

            gauge!("wireguard.peers", "interface" => iface.clone()).set(desired.len() as f64);
            gauge!("wireguard.rx_bytes", "interface" => iface.clone()).set(rx as f64);
            gauge!("wireguard.tx_bytes", "interface" => iface.clone()).set(tx as f64);
            log::debug!("{iface}: {added} peers added, {removed} removed, {updated} updated");
        }

        peers
            .iter()
            .filter(|peer| peer.key().is_ok_and(|key| connected.remove(&key)))
            .map(|peer| peer.public_key.clone())
            .collect()
    }
}

fn parse_peer(peer: &Peer) -> Option<(Key, Vec<Cidr>)> {
    let parsed = peer
        .key()
        .and_then(|key| Ok((key, peer.addresses()?)));

    match parsed {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            invalid_peer(peer, err);
            None
        }
    }
}

fn invalid_peer(peer: &Peer, err: impl std::fmt::Display) {
    log::warn!("skipping invalid peer {}: {err}", peer.public_key);
    counter!("wireguard.invalid_peers").increment(1);
}

fn set_peer<B: WireguardApi>(backend: &mut B, iface: &str, key: &Key, allowed_ips: &[Cidr]) -> bool {
    match backend.set_peer(iface, key, allowed_ips) {
        Ok(()) => true,
        Err(err) => {
            log::error!("error adding peer {key} on {iface}: {err}");
            counter!("wireguard.errors", "op" => "add").increment(1);
            false
        }
    }
}

fn remove_peer<B: WireguardApi>(backend: &mut B, iface: &str, key: &Key) -> bool {
    match backend.remove_peer(iface, key) {
        Ok(()) => true,
        Err(err) => {
            log::error!("error removing peer {key} on {iface}: {err}");
            counter!("wireguard.errors", "op" => "remove").increment(1);
            false
        }
    }
}

impl<B: WireguardApi> PeerManager for Wireguard<B> {
    fn add_peer(&mut self, peer: &Peer) {
        Wireguard::add_peer(self, peer)
    }

    fn remove_peer(&mut self, peer: &Peer) {
        Wireguard::remove_peer(self, peer)
    }

    fn update_peers(&mut self, peers: &[Peer]) -> Vec<String> {
        Wireguard::update_peers(self, peers)
    }
}
