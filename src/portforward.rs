//! Per-peer inbound port forwarding through DNAT rules in the nat table.
//!
//! The manager owns two chains, `<prefix>_TCP` and `<prefix>_UDP`, in both the
//! IPv4 and IPv6 nat tables, plus two ipsets. All of them are provisioned
//! outside this process; they are validated at startup and only mutated here.
//!
//! For a peer with at least one port, every address family it has an address
//! in gets one rule per protocol:
//!
//! ```text
//! -A PORTFORWARDING_TCP -p tcp -m set --match-set PORTFORWARDING_IPV4 dst -m multiport --dports 1234,4321 -j DNAT --to-destination 10.99.0.1
//! ```

use std::{
    collections::{BTreeSet, HashSet},
    net::IpAddr,
};

use metrics::{counter, gauge};

use crate::{api::Peer, error::Error, scheduler::PortforwardManager, wg::ParseError};

#[cfg(test)]
pub mod fake;
pub mod iptables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    pub fn of(ip: &IpAddr) -> Family {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Tcp, Protocol::Udp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }

    fn chain_suffix(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// One DNAT rule forwarding a peer's ports for a single protocol and family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnatRule {
    pub chain: String,
    pub protocol: Protocol,
    pub ipset: String,
    /// Sorted ascending, no duplicates.
    pub ports: Vec<u16>,
    pub destination: IpAddr,
}

impl DnatRule {
    pub fn family(&self) -> Family {
        Family::of(&self.destination)
    }

    /// Rule specification without the leading `-A <chain>`.
    pub fn args(&self) -> Vec<String> {
        let ports = self
            .ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let destination = self.destination.to_string();

        [
            "-p",
            self.protocol.as_str(),
            "-m",
            "set",
            "--match-set",
            self.ipset.as_str(),
            "dst",
            "-m",
            "multiport",
            "--dports",
            ports.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            destination.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

impl std::fmt::Display for DnatRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "-A {} {}", self.chain, self.args().join(" "))
    }
}

/// Splits a listed `-A <chain> ...` rule into its specification arguments.
fn listed_args(line: &str) -> Option<Vec<String>> {
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("-A") {
        return None;
    }
    tokens.next()?;

    Some(tokens.map(str::to_string).collect())
}

fn listed_destination(line: &str) -> Option<IpAddr> {
    let mut tokens = line.split_whitespace();
    tokens.find(|t| *t == "--to-destination")?;

    tokens.next()?.parse().ok()
}

/// Access to the nat table and ipsets.
pub trait Firewall {
    type Error: std::fmt::Display;

    fn chain_exists(&self, family: Family, chain: &str) -> Result<bool, Self::Error>;

    /// Rules of `chain` in `-S` form, `-A <chain> ...`, in table order.
    fn list_rules(&self, family: Family, chain: &str) -> Result<Vec<String>, Self::Error>;

    fn append_rule(
        &mut self,
        family: Family,
        chain: &str,
        rule: &[String],
    ) -> Result<(), Self::Error>;

    fn delete_rule(
        &mut self,
        family: Family,
        chain: &str,
        rule: &[String],
    ) -> Result<(), Self::Error>;

    fn ipset_exists(&self, name: &str) -> Result<bool, Self::Error>;

    fn ipset_members(&self, name: &str) -> Result<Vec<IpAddr>, Self::Error>;

    fn ipset_add(&mut self, name: &str, addr: IpAddr) -> Result<(), Self::Error>;

    fn ipset_del(&mut self, name: &str, addr: IpAddr) -> Result<(), Self::Error>;
}

pub struct Portforward<F> {
    firewall: F,
    chain_prefix: String,
    ipset_v4: String,
    ipset_v6: String,
}

impl<F: Firewall> Portforward<F> {
    pub fn new(
        firewall: F,
        chain_prefix: impl Into<String>,
        ipset_v4: impl Into<String>,
        ipset_v6: impl Into<String>,
    ) -> Result<Self, Error> {
        let pf = Self {
            firewall,
            chain_prefix: chain_prefix.into(),
            ipset_v4: ipset_v4.into(),
            ipset_v6: ipset_v6.into(),
        };

        for family in Family::ALL {
            for protocol in Protocol::ALL {
                let chain = pf.chain(protocol);
                let exists = pf
                    .firewall
                    .chain_exists(family, &chain)
                    .map_err(|err| Error::Firewall(err.to_string()))?;

                if !exists {
                    return Err(Error::MissingChain { family, chain });
                }
            }
        }

        for ipset in [&pf.ipset_v4, &pf.ipset_v6] {
            let exists = pf
                .firewall
                .ipset_exists(ipset)
                .map_err(|err| Error::Firewall(err.to_string()))?;

            if !exists {
                return Err(Error::MissingIpset(ipset.clone()));
            }
        }

        Ok(pf)
    }

    pub fn chain(&self, protocol: Protocol) -> String {
        format!("{}_{}", self.chain_prefix, protocol.chain_suffix())
    }

    fn ipset(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.ipset_v4,
            Family::V6 => &self.ipset_v6,
        }
    }

    /// The complete rule set for `peer`, empty when it forwards no ports.
    pub fn rules(&self, peer: &Peer) -> Result<Vec<DnatRule>, ParseError> {
        let addresses = peer.addresses()?;
        let ports = peer.sorted_ports();
        if ports.is_empty() {
            return Ok(Vec::new());
        }

        Ok(addresses
            .iter()
            .flat_map(|addr| {
                Protocol::ALL.map(|protocol| DnatRule {
                    chain: self.chain(protocol),
                    protocol,
                    ipset: self.ipset(Family::of(&addr.ip)).to_string(),
                    ports: ports.clone(),
                    destination: addr.ip,
                })
            })
            .collect())
    }

    pub fn add_portforwarding(&mut self, peer: &Peer) {
        let rules = match self.rules(peer) {
            Ok(rules) => rules,
            Err(err) => return invalid_peer(peer, err),
        };

        for rule in &rules {
            let family = rule.family();
            let present = match self.firewall.list_rules(family, &rule.chain) {
                Ok(listed) => listed.contains(&rule.to_string()),
                Err(err) => {
                    log::error!("error listing {family} chain {}: {err}", rule.chain);
                    counter!("portforward.errors", "op" => "list").increment(1);
                    continue;
                }
            };

            if !present {
                self.append(rule);
            }
        }

        let addresses: BTreeSet<IpAddr> = rules.iter().map(|r| r.destination).collect();
        for addr in addresses {
            self.ipset_add(addr);
        }
    }

    pub fn remove_portforwarding(&mut self, peer: &Peer) {
        let addresses = match peer.addresses() {
            Ok(addresses) => addresses,
            Err(err) => return invalid_peer(peer, err),
        };

        for addr in addresses {
            let family = Family::of(&addr.ip);

            for protocol in Protocol::ALL {
                let chain = self.chain(protocol);
                let listed = match self.firewall.list_rules(family, &chain) {
                    Ok(listed) => listed,
                    Err(err) => {
                        log::error!("error listing {family} chain {chain}: {err}");
                        counter!("portforward.errors", "op" => "list").increment(1);
                        continue;
                    }
                };

                for line in listed {
                    if listed_destination(&line) == Some(addr.ip) {
                        self.delete(family, &chain, &line);
                    }
                }
            }

            self.ipset_del(addr.ip);
        }
    }

    /// Replaces the peer's rules with the set implied by its current ports.
    pub fn update_single_peer_portforwarding(&mut self, peer: &Peer) {
        self.remove_portforwarding(peer);
        self.add_portforwarding(peer);
    }

    /// Brings both chains and the ipsets in line with `peers`. Returns the
    /// number of rules installed afterwards.
    pub fn update_portforwarding(&mut self, peers: &[Peer]) -> usize {
        let mut desired = Vec::new();
        for peer in peers {
            match self.rules(peer) {
                Ok(rules) => desired.extend(rules),
                Err(err) => invalid_peer(peer, err),
            }
        }

        let wanted_addresses: BTreeSet<IpAddr> = desired.iter().map(|r| r.destination).collect();
        let mut stale_addresses = BTreeSet::new();
        let mut total = 0usize;

        for family in Family::ALL {
            for protocol in Protocol::ALL {
                let chain = self.chain(protocol);
                let listed = match self.firewall.list_rules(family, &chain) {
                    Ok(listed) => listed,
                    Err(err) => {
                        log::error!("error listing {family} chain {chain}: {err}");
                        counter!("portforward.errors", "op" => "list").increment(1);
                        continue;
                    }
                };

                let wanted: Vec<&DnatRule> = desired
                    .iter()
                    .filter(|r| r.family() == family && r.protocol == protocol)
                    .collect();
                let wanted_text: HashSet<String> = wanted.iter().map(|r| r.to_string()).collect();

                let mut kept = HashSet::new();
                for line in listed {
                    if wanted_text.contains(&line) && !kept.contains(&line) {
                        kept.insert(line);
                        continue;
                    }

                    let destination = listed_destination(&line);
                    if self.delete(family, &chain, &line) {
                        stale_addresses.extend(destination);
                    }
                }

                for rule in wanted {
                    let text = rule.to_string();
                    if !kept.contains(&text) && self.append(rule) {
                        kept.insert(text);
                    }
                }

                total += kept.len();
            }
        }

        for addr in stale_addresses.difference(&wanted_addresses) {
            self.ipset_del(*addr);
        }

        for family in Family::ALL {
            let ipset = self.ipset(family).to_string();
            let members: BTreeSet<IpAddr> = match self.firewall.ipset_members(&ipset) {
                Ok(members) => members.into_iter().collect(),
                Err(err) => {
                    log::error!("error listing ipset {ipset}: {err}");
                    counter!("portforward.errors", "op" => "ipset_list").increment(1);
                    continue;
                }
            };

            for addr in &wanted_addresses {
                if Family::of(addr) == family && !members.contains(addr) {
                    self.ipset_add(*addr);
                }
            }
        }

        gauge!("portforward.rules").set(total as f64);
        log::debug!("{total} portforwarding rules installed");
        total
    }

    fn append(&mut self, rule: &DnatRule) -> bool {
        match self
            .firewall
            .append_rule(rule.family(), &rule.chain, &rule.args())
        {
            Ok(()) => true,
            Err(err) => {
                log::error!("error adding rule \"{rule}\": {err}");
                counter!("portforward.errors", "op" => "append").increment(1);
                false
            }
        }
    }

    fn delete(&mut self, family: Family, chain: &str, line: &str) -> bool {
        let Some(args) = listed_args(line) else {
            log::warn!("ignoring unexpected rule in {chain}: {line}");
            return false;
        };

        match self.firewall.delete_rule(family, chain, &args) {
            Ok(()) => true,
            Err(err) => {
                log::error!("error deleting rule \"{line}\": {err}");
                counter!("portforward.errors", "op" => "delete").increment(1);
                false
            }
        }
    }

    fn ipset_add(&mut self, addr: IpAddr) {
        let ipset = self.ipset(Family::of(&addr)).to_string();
        if let Err(err) = self.firewall.ipset_add(&ipset, addr) {
            log::error!("error adding {addr} to ipset {ipset}: {err}");
            counter!("portforward.errors", "op" => "ipset_add").increment(1);
        }
    }

    fn ipset_del(&mut self, addr: IpAddr) {
        let ipset = self.ipset(Family::of(&addr)).to_string();
        if let Err(err) = self.firewall.ipset_del(&ipset, addr) {
            log::error!("error removing {addr} from ipset {ipset}: {err}");
            counter!("portforward.errors", "op" => "ipset_del").increment(1);
        }
    }
}

fn invalid_peer(peer: &Peer, err: ParseError) {
    log::warn!("skipping portforwarding for invalid peer {}: {err}", peer.public_key);
    counter!("portforward.invalid_peers").increment(1);
}

impl<F: Firewall> PortforwardManager for Portforward<F> {
    fn add_portforwarding(&mut self, peer: &Peer) {
        Portforward::add_portforwarding(self, peer)
    }

    fn remove_portforwarding(&mut self, peer: &Peer) {
        Portforward::remove_portforwarding(self, peer)
    }

    fn update_single_peer_portforwarding(&mut self, peer: &Peer) {
        Portforward::update_single_peer_portforwarding(self, peer)
    }

    fn update_portforwarding(&mut self, peers: &[Peer]) {
        Portforward::update_portforwarding(self, peers);
    }
}
