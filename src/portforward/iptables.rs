use std::{net::IpAddr, process::Command};

use crate::{error::Error, wg::cmd::run};

use super::{Family, Firewall};

const TABLE: &str = "nat";
const IPSET: &str = "ipset";

/// Drives the nat table through `iptables`/`ip6tables` and sets through `ipset`.
#[derive(Debug, Default)]
pub struct IptablesBackend;

impl IptablesBackend {
    pub(crate) fn new() -> Self {
        Self
    }
}

fn program(family: Family) -> &'static str {
    match family {
        Family::V4 => "iptables",
        Family::V6 => "ip6tables",
    }
}

fn table_cmd<'a>(op: &'a str, chain: &'a str, rule: &'a [String]) -> Vec<&'a str> {
    ["-w", "-t", TABLE, op, chain]
        .into_iter()
        .chain(rule.iter().map(String::as_str))
        .collect()
}

fn parse_members(listing: &str) -> Vec<IpAddr> {
    listing
        .lines()
        .skip_while(|line| !line.starts_with("Members:"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().next()?.parse().ok())
        .collect()
}

impl Firewall for IptablesBackend {
    type Error = Error;

    fn chain_exists(&self, family: Family, chain: &str) -> Result<bool, Self::Error> {
        let status = Command::new(program(family))
            .args(table_cmd("-S", chain, &[]))
            .output()?
            .status;

        Ok(status.success())
    }

    fn list_rules(&self, family: Family, chain: &str) -> Result<Vec<String>, Self::Error> {
        let out = run(program(family), table_cmd("-S", chain, &[]))?;

        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter(|line| line.starts_with("-A "))
            .map(str::to_string)
            .collect())
    }

    fn append_rule(
        &mut self,
        family: Family,
        chain: &str,
        rule: &[String],
    ) -> Result<(), Self::Error> {
        run(program(family), table_cmd("-A", chain, rule))?;
        Ok(())
    }

    fn delete_rule(
        &mut self,
        family: Family,
        chain: &str,
        rule: &[String],
    ) -> Result<(), Self::Error> {
        run(program(family), table_cmd("-D", chain, rule))?;
        Ok(())
    }

    fn ipset_exists(&self, name: &str) -> Result<bool, Self::Error> {
        let status = Command::new(IPSET).args(["-n", "list", name]).output()?.status;

        Ok(status.success())
    }

    fn ipset_members(&self, name: &str) -> Result<Vec<IpAddr>, Self::Error> {
        let out = run(IPSET, ["list", name])?;

        Ok(parse_members(&String::from_utf8_lossy(&out.stdout)))
    }

    fn ipset_add(&mut self, name: &str, addr: IpAddr) -> Result<(), Self::Error> {
        let addr = addr.to_string();
        run(IPSET, ["add", name, addr.as_str(), "-exist"])?;
        Ok(())
    }

    fn ipset_del(&mut self, name: &str, addr: IpAddr) -> Result<(), Self::Error> {
        let addr = addr.to_string();
        run(IPSET, ["del", name, addr.as_str(), "-exist"])?;
        Ok(())
    }
}
