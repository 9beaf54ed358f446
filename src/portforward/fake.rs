//! In-memory stand-in for the nat table and ipsets.

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

use super::{Family, Firewall};

#[derive(Debug, thiserror::Error)]
pub enum FakeError {
    #[error("no chain/target/match by that name: {0}")]
    NoChain(String),

    #[error("bad rule (does a matching rule exist in that chain?)")]
    NoRule,

    #[error("the set with the given name does not exist: {0}")]
    NoSet(String),

    #[error("injected failure for {0}")]
    Injected(IpAddr),
}

#[derive(Debug, Default)]
pub struct FakeFirewall {
    pub chains: BTreeMap<(Family, String), Vec<String>>,
    pub ipsets: BTreeMap<String, BTreeSet<IpAddr>>,
    /// Rules forwarding to these addresses fail to append.
    pub failing: BTreeSet<IpAddr>,
    /// Successful table or set changes.
    pub mutations: usize,
}

impl FakeFirewall {
    pub fn provisioned(prefix: &str, ipsets: &[&str]) -> Self {
        let mut chains = BTreeMap::new();
        for family in Family::ALL {
            for suffix in ["TCP", "UDP"] {
                chains.insert((family, format!("{prefix}_{suffix}")), Vec::new());
            }
        }

        Self {
            chains,
            ipsets: ipsets
                .iter()
                .map(|name| (name.to_string(), BTreeSet::new()))
                .collect(),
            ..Default::default()
        }
    }

    /// Every rule, IPv4 before IPv6, chains in name order.
    pub fn all_rules(&self) -> Vec<String> {
        self.chains.values().flatten().cloned().collect()
    }

    pub fn ipset(&self, name: &str) -> BTreeSet<IpAddr> {
        self.ipsets.get(name).cloned().unwrap_or_default()
    }

    fn chain_mut(&mut self, family: Family, chain: &str) -> Result<&mut Vec<String>, FakeError> {
        self.chains
            .get_mut(&(family, chain.to_string()))
            .ok_or_else(|| FakeError::NoChain(chain.to_string()))
    }

    fn set_mut(&mut self, name: &str) -> Result<&mut BTreeSet<IpAddr>, FakeError> {
        self.ipsets
            .get_mut(name)
            .ok_or_else(|| FakeError::NoSet(name.to_string()))
    }
}

impl Firewall for FakeFirewall {
    type Error = FakeError;

    fn chain_exists(&self, family: Family, chain: &str) -> Result<bool, Self::Error> {
        Ok(self.chains.contains_key(&(family, chain.to_string())))
    }

    fn list_rules(&self, family: Family, chain: &str) -> Result<Vec<String>, Self::Error> {
        self.chains
            .get(&(family, chain.to_string()))
            .cloned()
            .ok_or_else(|| FakeError::NoChain(chain.to_string()))
    }

    fn append_rule(
        &mut self,
        family: Family,
        chain: &str,
        rule: &[String],
    ) -> Result<(), Self::Error> {
        if let Some(addr) = self
            .failing
            .iter()
            .find(|addr| rule.last() == Some(&addr.to_string()))
        {
            return Err(FakeError::Injected(*addr));
        }

        let line = format!("-A {chain} {}", rule.join(" "));
        self.chain_mut(family, chain)?.push(line);
        self.mutations += 1;
        Ok(())
    }

    fn delete_rule(
        &mut self,
        family: Family,
        chain: &str,
        rule: &[String],
    ) -> Result<(), Self::Error> {
        let line = format!("-A {chain} {}", rule.join(" "));
        let rules = self.chain_mut(family, chain)?;
        let pos = rules
            .iter()
            .position(|r| *r == line)
            .ok_or(FakeError::NoRule)?;

        rules.remove(pos);
        self.mutations += 1;
        Ok(())
    }

    fn ipset_exists(&self, name: &str) -> Result<bool, Self::Error> {
        Ok(self.ipsets.contains_key(name))
    }

    fn ipset_members(&self, name: &str) -> Result<Vec<IpAddr>, Self::Error> {
        self.ipsets
            .get(name)
            .map(|set| set.iter().copied().collect())
            .ok_or_else(|| FakeError::NoSet(name.to_string()))
    }

    fn ipset_add(&mut self, name: &str, addr: IpAddr) -> Result<(), Self::Error> {
        if self.set_mut(name)?.insert(addr) {
            self.mutations += 1;
        }
        Ok(())
    }

    fn ipset_del(&mut self, name: &str, addr: IpAddr) -> Result<(), Self::Error> {
        if self.set_mut(name)?.remove(&addr) {
            self.mutations += 1;
        }
        Ok(())
    }
}
