use std::{
    ffi::OsStr,
    process::{Command, Output},
};

use crate::error::Error;

use super::{Cidr, Key, WireguardApi, dump, peer::WgPeerInfo};

const WG: &str = "wg";

/// Runs `program` to completion, turning a non-zero exit into an error.
pub(crate) fn run<I, S>(program: &'static str, args: I) -> Result<Output, Error>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = Command::new(program).args(args).output()?;

    if !out.status.success() {
        return Err(Error::CommandFail {
            program,
            code: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }

    Ok(out)
}

/// Drives the kernel interfaces through the `wg` tool.
#[derive(Debug, Default)]
pub struct WgCmdBackend;

impl WgCmdBackend {
    pub(crate) fn new() -> Self {
        Self
    }
}

impl WireguardApi for WgCmdBackend {
    type Error = Error;

    fn get_peers(&self, iface: &str) -> Result<Vec<WgPeerInfo>, Self::Error> {
        let out = run(WG, ["show", iface, "dump"])?;
        let table = String::from_utf8_lossy(&out.stdout);

        Ok(dump::parse_dump(&table)?)
    }

    fn set_peer(
        &mut self,
        iface: &str,
        key: &Key,
        allowed_ips: &[Cidr],
    ) -> Result<(), Self::Error> {
        let allowed_ips = allowed_ips
            .iter()
            .map(Cidr::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let key = key.to_string();

        run(
            WG,
            ["set", iface, "peer", key.as_str(), "allowed-ips", allowed_ips.as_str()],
        )?;

        Ok(())
    }

    fn remove_peer(&mut self, iface: &str, key: &Key) -> Result<(), Self::Error> {
        let key = key.to_string();
        run(WG, ["set", iface, "peer", key.as_str(), "remove"])?;

        Ok(())
    }
}
