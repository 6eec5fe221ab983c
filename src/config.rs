use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::Error as OrchestratorError;

#[derive(Error, Debug)]
pub enum NetweaveConfigError {
    #[error("cannot load config file")]
    Load(#[from] io::Error),
    #[error("cannot parse config file")]
    Parse(#[from] serde_json::Error),
}

/// The desired-state document. Loaded from disk once at startup and mutated
/// in memory by the API; the reconciler walks it every cycle.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
pub struct NetweaveConfig {
    /// Desired bridges, keyed by bridge name.
    #[serde(default)]
    pub bridge: HashMap<String, BridgeSpec>,
    /// Desired container interfaces, keyed by container name.
    #[serde(default)]
    pub container: HashMap<String, Vec<ContainerIfaceSpec>>,
    /// Desired veth pairs, keyed by name prefix.
    #[serde(default)]
    pub veth_pairs: HashMap<String, VethPairSpec>,
}

impl NetweaveConfig {
    pub fn load(path: &str) -> Result<Self, NetweaveConfigError> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Merge an applied bridge mutation: parent lists extend, scalars replace.
    pub fn merge_bridge(&mut self, name: &str, spec: &BridgeSpec) {
        let entry = self.bridge.entry(name.to_string()).or_default();
        entry.parents.extend(spec.parents.iter().cloned());
        entry.ipaddress = spec.ipaddress.clone();
        entry.ip6address = spec.ip6address.clone();
        entry.iprange = spec.iprange.clone();
        entry.ip6range = spec.ip6range.clone();
    }

    pub fn merge_container_iface(&mut self, container: &str, spec: &ContainerIfaceSpec) {
        self.container
            .entry(container.to_string())
            .or_default()
            .push(spec.clone());
    }

    pub fn merge_veth_pair(&mut self, prefix: &str, spec: &VethPairSpec) {
        self.veth_pairs.insert(prefix.to_string(), spec.clone());
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
pub struct BridgeSpec {
    /// Host-on-bridge IPv4 address with prefix, inside `iprange`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6address: Option<String>,
    /// Subnet the bridge allocates container addresses from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iprange: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6range: Option<String>,
    #[serde(default)]
    pub parents: Vec<ParentSpec>,
}

/// An uplink interface of a bridge. `iface` may be a `usb:<bus-id>` sentinel
/// resolved at attach time.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
pub struct ParentSpec {
    pub iface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,
}

impl ParentSpec {
    pub fn mode(&self) -> Result<Option<VlanMode>, OrchestratorError> {
        vlan_mode(&self.vlan, &self.trunk, &self.native)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
pub struct ContainerIfaceSpec {
    /// Interface name inside the container.
    pub iface: String,
    /// Bridge the interface hangs off.
    pub bridge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trunk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native: Option<String>,
    /// `"No-IP"` opts out of address assignment entirely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipaddress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip6address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway6: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub macaddress: Option<String>,
}

impl ContainerIfaceSpec {
    /// The attach helpers only know `set-vlan` and `set-trunk`, so `native`
    /// is rejected here.
    pub fn mode(&self) -> Result<Option<VlanMode>, OrchestratorError> {
        let mode = vlan_mode(&self.vlan, &self.trunk, &self.native)?;
        if matches!(mode, Some(VlanMode::Native(_))) {
            return Err(OrchestratorError::validation(format!(
                "native VLAN is not supported on container interface {}",
                self.iface
            )));
        }
        Ok(mode)
    }
}

#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct VethPairSpec {
    /// Bridge both ends attach to.
    pub on: String,
    /// `"source:dest"` VLAN translation map; empty dest leaves the second
    /// end dangling.
    #[serde(default = "default_vlan_map")]
    pub map: String,
    /// `"yes"` interprets the map segments as trunk lists.
    #[serde(default = "default_trunk")]
    pub trunk: String,
}

fn default_vlan_map() -> String {
    String::from(":")
}

fn default_trunk() -> String {
    String::from("no")
}

/// A validated VLAN setting. The wire format carries up to three independent
/// string fields; after validation exactly one survives.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum VlanMode {
    /// Untagged port, ingress tagged with this VID.
    Access(u16),
    /// Tagged port passing the listed VIDs.
    Trunk(Vec<u16>),
    /// Like access, but tagged frames are accepted too.
    Native(u16),
}

impl VlanMode {
    pub fn vids(&self) -> Vec<u16> {
        match self {
            VlanMode::Access(vid) | VlanMode::Native(vid) => vec![*vid],
            VlanMode::Trunk(vids) => vids.clone(),
        }
    }

    /// The setting as it appears on a command line.
    pub fn vid_arg(&self) -> String {
        match self {
            VlanMode::Access(vid) | VlanMode::Native(vid) => vid.to_string(),
            VlanMode::Trunk(vids) => vids
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Parse a comma-separated VID list. Each entry must be all digits (no
/// surrounding whitespace) and between 1 and 4095.
pub fn parse_vids(value: &str) -> Result<Vec<u16>, OrchestratorError> {
    let mut vids = Vec::new();
    for part in value.split(',') {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(OrchestratorError::validation(format!(
                "VLAN {part:?} should be a numeric string"
            )));
        }
        let vid: u32 = part.parse().map_err(|_| {
            OrchestratorError::validation(format!("VLAN {part} should be between 1 and 4095"))
        })?;
        if !(1..=4095).contains(&vid) {
            return Err(OrchestratorError::validation(format!(
                "VLAN {part} should be between 1 and 4095"
            )));
        }
        vids.push(vid as u16);
    }
    Ok(vids)
}

pub fn vlan_mode(
    vlan: &Option<String>,
    trunk: &Option<String>,
    native: &Option<String>,
) -> Result<Option<VlanMode>, OrchestratorError> {
    let set = [vlan, trunk, native].iter().filter(|v| v.is_some()).count();
    if set > 1 {
        return Err(OrchestratorError::validation(
            "at most one of vlan, trunk or native may be set",
        ));
    }
    if let Some(value) = vlan {
        let vids = parse_vids(value)?;
        if vids.len() != 1 {
            return Err(OrchestratorError::validation(format!(
                "access VLAN {value} must be a single id"
            )));
        }
        return Ok(Some(VlanMode::Access(vids[0])));
    }
    if let Some(value) = trunk {
        return Ok(Some(VlanMode::Trunk(parse_vids(value)?)));
    }
    if let Some(value) = native {
        let vids = parse_vids(value)?;
        if vids.len() != 1 {
            return Err(OrchestratorError::validation(format!(
                "native VLAN {value} must be a single id"
            )));
        }
        return Ok(Some(VlanMode::Native(vids[0])));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vid_lists_accept_the_valid_range() {
        assert_eq!(parse_vids("1").unwrap(), vec![1]);
        assert_eq!(parse_vids("4095").unwrap(), vec![4095]);
        assert_eq!(parse_vids("100,200").unwrap(), vec![100, 200]);
    }

    #[test]
    fn vid_lists_reject_out_of_range_and_garbage() {
        for bad in ["0", "4096", "abc", " 10", "", "100,", "10_0", "99999999999"] {
            assert!(parse_vids(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn at_most_one_vlan_mode_is_accepted() {
        let vlan = Some("100".to_string());
        let trunk = Some("100,200".to_string());
        assert!(vlan_mode(&vlan, &trunk, &None).is_err());
        assert_eq!(vlan_mode(&None, &None, &None).unwrap(), None);
        assert_eq!(
            vlan_mode(&vlan, &None, &None).unwrap(),
            Some(VlanMode::Access(100))
        );
        assert_eq!(
            vlan_mode(&None, &trunk, &None).unwrap(),
            Some(VlanMode::Trunk(vec![100, 200]))
        );
        assert_eq!(
            vlan_mode(&None, &None, &Some("300".to_string())).unwrap(),
            Some(VlanMode::Native(300))
        );
    }

    #[test]
    fn access_and_native_take_a_single_id() {
        assert!(vlan_mode(&Some("100,200".to_string()), &None, &None).is_err());
        assert!(vlan_mode(&None, &None, &Some("100,200".to_string())).is_err());
    }

    #[test]
    fn native_is_rejected_on_container_interfaces() {
        let spec = ContainerIfaceSpec {
            iface: "eth0".to_string(),
            bridge: "br0".to_string(),
            native: Some("100".to_string()),
            ..Default::default()
        };
        assert!(spec.mode().is_err());
    }

    #[test]
    fn parses_the_desired_state_document() {
        let doc = r#"{
            "bridge": {
                "br0": {
                    "iprange": "10.1.0.0/24",
                    "ipaddress": "10.1.0.1/24",
                    "parents": [{"iface": "eth1", "trunk": "100,200"}]
                }
            },
            "container": {
                "c1": [{"bridge": "br0", "iface": "eth0", "vlan": "100"}]
            },
            "veth_pairs": {
                "vmap1": {"on": "br0", "map": "10:"}
            }
        }"#;
        let config: NetweaveConfig = serde_json::from_str(doc).unwrap();

        let br0 = &config.bridge["br0"];
        assert_eq!(br0.iprange.as_deref(), Some("10.1.0.0/24"));
        assert_eq!(
            br0.parents[0].mode().unwrap(),
            Some(VlanMode::Trunk(vec![100, 200]))
        );
        assert_eq!(
            config.container["c1"][0].mode().unwrap(),
            Some(VlanMode::Access(100))
        );
        // missing trunk field falls back to "no"
        assert_eq!(config.veth_pairs["vmap1"].trunk, "no");
        assert_eq!(config.veth_pairs["vmap1"].map, "10:");
    }

    #[test]
    fn merging_a_bridge_extends_parents_and_replaces_scalars() {
        let mut config = NetweaveConfig::default();
        config.merge_bridge(
            "br0",
            &BridgeSpec {
                iprange: Some("10.1.0.0/24".to_string()),
                parents: vec![ParentSpec {
                    iface: "eth1".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );
        config.merge_bridge(
            "br0",
            &BridgeSpec {
                iprange: Some("10.2.0.0/24".to_string()),
                parents: vec![ParentSpec {
                    iface: "eth2".to_string(),
                    ..Default::default()
                }],
                ..Default::default()
            },
        );

        let br0 = &config.bridge["br0"];
        assert_eq!(br0.iprange.as_deref(), Some("10.2.0.0/24"));
        let ifaces: Vec<_> = br0.parents.iter().map(|p| p.iface.as_str()).collect();
        assert_eq!(ifaces, vec!["eth1", "eth2"]);
    }

    #[test]
    fn merging_container_interfaces_appends() {
        let mut config = NetweaveConfig::default();
        let spec = ContainerIfaceSpec {
            iface: "eth0".to_string(),
            bridge: "br0".to_string(),
            ..Default::default()
        };
        config.merge_container_iface("c1", &spec);
        config.merge_container_iface(
            "c1",
            &ContainerIfaceSpec {
                iface: "eth1".to_string(),
                ..spec
            },
        );
        assert_eq!(config.container["c1"].len(), 2);
    }
}
