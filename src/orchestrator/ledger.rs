use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

#[allow(unused_imports)]
use cidr::{Cidr, Inet};
use cidr::{IpCidr, IpInet};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::VlanMode;

use super::{Error, Family};

/// Host addresses reserved at the head of every range (gateway and other
/// infrastructure), on top of the network address itself.
const RESERVED_HOSTS: u32 = 5;

/// What was applied to one container interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IfaceFacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<VlanMode>,
}

impl IfaceFacts {
    pub fn set_addr(&mut self, family: Family, addr: String) {
        match family {
            Family::V4 => self.ipv4 = Some(addr),
            Family::V6 => self.ipv6 = Some(addr),
        }
    }
}

/// Applied state for one bridge. `*_hosts` maps holders (the bridge itself,
/// containers) to their reserved `addr/prefix`; at most one holder per value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeLedger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iprange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6range: Option<String>,
    #[serde(default)]
    pub iprange_hosts: HashMap<String, String>,
    #[serde(default)]
    pub ip6range_hosts: HashMap<String, String>,
    /// VLAN mode last applied per parent interface.
    #[serde(default)]
    pub parents: HashMap<String, VlanMode>,
    /// Facts per container, per interface name inside the container.
    #[serde(default)]
    pub containers: HashMap<String, HashMap<String, IfaceFacts>>,
}

impl BridgeLedger {
    pub fn range(&self, family: Family) -> Option<&String> {
        match family {
            Family::V4 => self.iprange.as_ref(),
            Family::V6 => self.ip6range.as_ref(),
        }
    }

    pub fn set_range(&mut self, family: Family, range: Option<String>) {
        match family {
            Family::V4 => self.iprange = range,
            Family::V6 => self.ip6range = range,
        }
    }

    pub fn hosts(&self, family: Family) -> &HashMap<String, String> {
        match family {
            Family::V4 => &self.iprange_hosts,
            Family::V6 => &self.ip6range_hosts,
        }
    }

    pub fn hosts_mut(&mut self, family: Family) -> &mut HashMap<String, String> {
        match family {
            Family::V4 => &mut self.iprange_hosts,
            Family::V6 => &mut self.ip6range_hosts,
        }
    }

    pub fn reserved_by_other(&self, family: Family, holder: &str, addr: &str) -> bool {
        self.hosts(family)
            .iter()
            .any(|(name, value)| name != holder && value == addr)
    }
}

/// The persistent ledger: what was already done, per bridge, plus the
/// consecutive-failure counter. Loaded at startup and written back after
/// every cycle and API mutation so reservations survive restarts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Ledger {
    #[serde(default)]
    pub failed: u32,
    #[serde(default)]
    pub bridges: HashMap<String, BridgeLedger>,
    #[serde(skip)]
    path: PathBuf,
}

impl Ledger {
    /// Load from disk; a missing file starts an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let mut ledger: Ledger = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ledger::default(),
            Err(err) => return Err(err.into()),
        };
        ledger.path = path;
        Ok(ledger)
    }

    pub fn save(&self) -> Result<(), Error> {
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }

    pub fn bridge(&mut self, name: &str) -> &mut BridgeLedger {
        self.bridges.entry(name.to_string()).or_default()
    }

    /// Reserve the first free host address of the bridge's range for
    /// `holder`. The network address and the first five hosts stay reserved.
    pub fn auto_allocate(
        &mut self,
        bridge: &str,
        holder: &str,
        family: Family,
    ) -> Result<String, Error> {
        let entry = self.bridge(bridge);
        let Some(range) = entry.range(family).cloned() else {
            return Err(Error::NoRange {
                bridge: bridge.to_string(),
                family,
            });
        };

        let exhausted = || Error::RangeExhausted {
            bridge: bridge.to_string(),
            range: range.clone(),
            family,
        };

        let cidr: IpCidr = range
            .parse()
            .map_err(|_| Error::BadAddress(format!("cannot parse range {range}")))?;
        let prefix = cidr.network_length();
        let mut cursor = IpInet::new(cidr.first_address(), prefix)
            .map_err(|_| Error::BadAddress(format!("cannot parse range {range}")))?;

        for _ in 0..(RESERVED_HOSTS + 1) {
            if cursor.increment() {
                return Err(exhausted());
            }
        }

        let hosts = entry.hosts_mut(family);
        loop {
            if cidr.is_ipv4() && cursor.address() == cidr.last_address() {
                // the broadcast address is not a usable host
                return Err(exhausted());
            }
            let candidate = format!("{}/{}", cursor.address(), prefix);
            if !hosts.values().any(|used| used == &candidate) {
                debug!("automatic {} allocation ({}) to {}", family, candidate, holder);
                hosts.insert(holder.to_string(), candidate.clone());
                return Ok(candidate);
            }
            if cursor.increment() {
                return Err(exhausted());
            }
        }
    }
}
