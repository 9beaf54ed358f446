//! In-memory stand-in for the kernel peer table.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::SystemTime,
};

use super::{Cidr, Key, WireguardApi, peer::WgPeerInfo};

#[derive(Debug, thiserror::Error)]
pub enum FakeError {
    #[error("no such device: {0}")]
    NoDevice(String),

    #[error("injected failure for {0}")]
    Injected(Key),
}

#[derive(Debug, Default)]
pub struct FakeWireguard {
    pub devices: BTreeMap<String, BTreeMap<Key, WgPeerInfo>>,
    /// Keys whose mutations fail.
    pub failing: BTreeSet<Key>,
    /// Number of `set_peer` calls, used to detect churn.
    pub writes: usize,
}

impl FakeWireguard {
    pub fn with_interfaces(names: &[&str]) -> Self {
        Self {
            devices: names
                .iter()
                .map(|name| (name.to_string(), BTreeMap::new()))
                .collect(),
            ..Default::default()
        }
    }

    pub fn keys(&self, iface: &str) -> Vec<Key> {
        self.devices
            .get(iface)
            .map(|peers| peers.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn handshake(&mut self, iface: &str, key: &Key, at: SystemTime) {
        if let Some(peer) = self.devices.get_mut(iface).and_then(|d| d.get_mut(key)) {
            peer.latest_handshake = Some(at);
        }
    }

    fn device(&mut self, iface: &str) -> Result<&mut BTreeMap<Key, WgPeerInfo>, FakeError> {
        self.devices
            .get_mut(iface)
            .ok_or_else(|| FakeError::NoDevice(iface.to_string()))
    }
}

impl WireguardApi for FakeWireguard {
    type Error = FakeError;

    fn get_peers(&self, iface: &str) -> Result<Vec<WgPeerInfo>, Self::Error> {
        self.devices
            .get(iface)
            .map(|peers| peers.values().cloned().collect())
            .ok_or_else(|| FakeError::NoDevice(iface.to_string()))
    }

    fn set_peer(
        &mut self,
        iface: &str,
        key: &Key,
        allowed_ips: &[Cidr],
    ) -> Result<(), Self::Error> {
        if self.failing.contains(key) {
            return Err(FakeError::Injected(*key));
        }

        self.writes += 1;
        self.device(iface)?
            .entry(*key)
            .or_insert_with(|| WgPeerInfo {
                public_key: *key,
                ..Default::default()
            })
            .allowed_ips = allowed_ips.to_vec();

        Ok(())
    }

    fn remove_peer(&mut self, iface: &str, key: &Key) -> Result<(), Self::Error> {
        if self.failing.contains(key) {
            return Err(FakeError::Injected(*key));
        }

        self.device(iface)?.remove(key);
        Ok(())
    }
}
