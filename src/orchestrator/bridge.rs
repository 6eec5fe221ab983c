use std::collections::BTreeSet;

#[allow(unused_imports)]
use cidr::{Cidr, Inet};
use cidr::{IpCidr, IpInet};
use tracing::{debug, info};

use crate::config::{BridgeSpec, ParentSpec, VlanMode};

use super::host::Host;
use super::ledger::Ledger;
use super::{Backend, Error, Family};

/// Drive one bridge toward its spec: existence and backend, per-family
/// address, then parent uplinks.
pub async fn ensure_bridge(
    host: &Host,
    ledger: &mut Ledger,
    backend: Backend,
    name: &str,
    spec: &BridgeSpec,
) -> Result<(), Error> {
    create_bridge(host, backend, name).await?;

    for family in Family::BOTH {
        reconcile_address(host, ledger, name, spec, family).await?;
    }

    for parent in &spec.parents {
        attach_parent(host, ledger, backend, name, parent).await?;
    }
    Ok(())
}

async fn create_bridge(host: &Host, backend: Backend, name: &str) -> Result<(), Error> {
    let exists_cmd = match backend {
        Backend::Ovs => format!("ovs-vsctl br-exists {name}"),
        Backend::Linux => format!("brctl show {name}"),
    };
    if host.run(&exists_cmd, false).await?.ok() {
        debug!("bridge {} already exists", name);
        return Ok(());
    }

    // A link with this name in the wrong backend has to go first.
    if host.run(&format!("ip link show dev {name}"), false).await?.ok() {
        debug!("bridge {} exists but not on the right backend", name);
        host.run(&format!("ip link set {name} down"), true).await?;
        host.run(&format!("ovs-vsctl del-br {name}"), false).await?;
        host.run(&format!("brctl delbr {name}"), false).await?;
        info!("removed stale bridge {}", name);
    }

    match backend {
        Backend::Ovs => {
            host.run(&format!("ovs-vsctl --may-exist add-br {name}"), true)
                .await?;
        }
        Backend::Linux => {
            host.run(&format!("brctl addbr {name}"), false).await?;
        }
    }
    host.run(&format!("ip link set {name} up"), true).await?;
    info!("bridge {} created and brought up", name);
    Ok(())
}

async fn reconcile_address(
    host: &Host,
    ledger: &mut Ledger,
    name: &str,
    spec: &BridgeSpec,
    family: Family,
) -> Result<(), Error> {
    let (spec_range, spec_addr) = match family {
        Family::V4 => (&spec.iprange, &spec.ipaddress),
        Family::V6 => (&spec.ip6range, &spec.ip6address),
    };

    let entry = ledger.bridge(name);
    if entry.range(family) != spec_range.as_ref() {
        // reservations made under the old range are stale
        debug!("updating {} range for {} to {:?}", family, name, spec_range);
        entry.set_range(family, spec_range.clone());
        entry.hosts_mut(family).clear();
    }

    let Some(addr) = spec_addr else {
        debug!("flushing {} address for {}", family, name);
        entry.hosts_mut(family).remove(name);
        host.run(&format!("ip {} addr flush dev {name}", family.flag()), false)
            .await?;
        return Ok(());
    };

    let mut set_ip = false;
    let mut cache_changed = false;

    if entry.hosts(family).get(name) != Some(addr) {
        entry.hosts_mut(family).remove(name);
        host.run(&format!("ip {} addr flush dev {name}", family.flag()), false)
            .await?;
        set_ip = true;
        cache_changed = true;
    } else {
        let current = match family {
            Family::V4 => host.iface_ipv4s(name).await?,
            Family::V6 => host.iface_ipv6s(name).await?,
        };
        // the address was lost from the link, re-add it
        if !current.contains(addr) {
            set_ip = true;
        }
    }

    if !set_ip {
        return Ok(());
    }

    if cache_changed && entry.reserved_by_other(family, name, addr) {
        return Err(Error::AddressConflict {
            bridge: name.to_string(),
            addr: addr.clone(),
        });
    }

    let Some(range) = entry.range(family).cloned() else {
        return Err(Error::NoRange {
            bridge: name.to_string(),
            family,
        });
    };
    let inet: IpInet = addr
        .parse()
        .map_err(|_| Error::BadAddress(format!("cannot parse address {addr}")))?;
    let cidr: IpCidr = range
        .parse()
        .map_err(|_| Error::BadAddress(format!("cannot parse range {range}")))?;
    if !cidr.contains(&inet.address()) {
        return Err(Error::OutOfRange {
            addr: addr.clone(),
            range,
        });
    }

    entry.hosts_mut(family).insert(name.to_string(), addr.clone());
    host.run(&format!("ip addr add {addr} dev {name}"), true)
        .await?;
    info!("updated {} address for {} to {}", family, name, addr);
    Ok(())
}

async fn attach_parent(
    host: &Host,
    ledger: &mut Ledger,
    backend: Backend,
    bridge: &str,
    parent: &ParentSpec,
) -> Result<(), Error> {
    let mode = parent.mode()?;

    let mut iface = parent.iface.clone();
    if let Some(bus) = parent.iface.strip_prefix("usb:") {
        iface = host.resolve_usb(bus).await?;
        debug!("resolved usb bus {} to {}", bus, iface);
    }

    debug!("bringing up parent {} for bridge {}", iface, bridge);
    host.run(&format!("ip link set {iface} up"), true).await?;

    attach_iface(host, ledger, backend, bridge, &iface, mode.as_ref()).await
}

/// Attach any interface (parent uplink or veth end) to a bridge and
/// reconcile its VLAN setting against the single desired mode.
pub(crate) async fn attach_iface(
    host: &Host,
    ledger: &mut Ledger,
    backend: Backend,
    bridge: &str,
    iface: &str,
    mode: Option<&VlanMode>,
) -> Result<(), Error> {
    match backend {
        Backend::Ovs => attach_iface_ovs(host, ledger, bridge, iface, mode).await,
        Backend::Linux => attach_iface_linux(host, ledger, bridge, iface, mode).await,
    }
}

async fn attach_iface_ovs(
    host: &Host,
    ledger: &mut Ledger,
    bridge: &str,
    iface: &str,
    mode: Option<&VlanMode>,
) -> Result<(), Error> {
    if !host.bridge_contains(Backend::Ovs, bridge, iface).await? {
        debug!("port {} not part of OVS bridge {}", iface, bridge);
        host.run(&format!("ovs-vsctl --if-exists del-port {iface}"), false)
            .await?;
        host.run(&format!("ovs-vsctl --may-exist add-port {bridge} {iface}"), true)
            .await?;
    }

    // Both VLAN columns get reconciled against the one desired mode, so a
    // mode change always undoes the previous setting.
    let desired_trunks: Vec<u16> = match mode {
        Some(VlanMode::Trunk(vids)) => vids.clone(),
        _ => Vec::new(),
    };
    let desired_tag: Vec<u16> = match mode {
        Some(VlanMode::Access(vid)) | Some(VlanMode::Native(vid)) => vec![*vid],
        _ => Vec::new(),
    };

    // The tag column alone cannot tell access from native-untagged, so a
    // change of mode kind forces a remove and reapply even when the VID
    // matches.
    let cached = ledger.bridge(bridge).parents.get(iface).cloned();
    let kind_changed = match (cached.as_ref(), mode) {
        (Some(prev), Some(next)) => !same_kind(prev, next),
        _ => false,
    };

    let current_trunks = column_vids(
        &host
            .run(&format!("ovs-vsctl get port {iface} trunks"), false)
            .await?
            .stdout,
    );
    if !current_trunks.is_empty() && vid_set(&current_trunks) != vid_set(&desired_trunks) {
        info!("removing stale trunks {:?} from port {}", current_trunks, iface);
        host.run(
            &format!("ovs-vsctl remove port {iface} trunks {}", join_vids(&current_trunks)),
            true,
        )
        .await?;
    }

    let current_tag = column_vids(
        &host
            .run(&format!("ovs-vsctl get port {iface} tag"), false)
            .await?
            .stdout,
    );
    if !current_tag.is_empty() && (current_tag != desired_tag || kind_changed) {
        info!("removing stale tag {:?} from port {}", current_tag, iface);
        host.run(
            &format!("ovs-vsctl remove port {iface} tag {}", join_vids(&current_tag)),
            true,
        )
        .await?;
    }

    // leaving native mode also means clearing vlan_mode on the port
    let leaving_native = matches!(cached, Some(VlanMode::Native(_)))
        && !matches!(mode, Some(VlanMode::Native(_)));
    if leaving_native {
        host.run(
            &format!("ovs-vsctl remove port {iface} vlan_mode native-untagged"),
            true,
        )
        .await?;
        info!("cleared native vlan_mode from port {}", iface);
    }

    let Some(mode) = mode else {
        ledger.bridge(bridge).parents.remove(iface);
        return Ok(());
    };

    let applied = !kind_changed
        && match mode {
            VlanMode::Trunk(vids) => vid_set(&current_trunks) == vid_set(vids),
            VlanMode::Access(_) | VlanMode::Native(_) => current_tag == desired_tag,
        };
    if !applied {
        let cmd = match mode {
            VlanMode::Trunk(_) => {
                format!("ovs-vsctl set port {iface} trunks={}", mode.vid_arg())
            }
            VlanMode::Access(vid) => format!("ovs-vsctl set port {iface} tag={vid}"),
            VlanMode::Native(vid) => {
                format!("ovs-vsctl set port {iface} vlan_mode=native-untagged tag={vid}")
            }
        };
        host.run(&cmd, true).await?;
        info!("applied VLAN setting {:?} to port {}", mode, iface);
    }

    let cache = &mut ledger.bridge(bridge).parents;
    if cache.get(iface) != Some(mode) {
        cache.insert(iface.to_string(), mode.clone());
    }
    Ok(())
}

async fn attach_iface_linux(
    host: &Host,
    ledger: &mut Ledger,
    bridge: &str,
    iface: &str,
    mode: Option<&VlanMode>,
) -> Result<(), Error> {
    if !host.bridge_contains(Backend::Linux, bridge, iface).await? {
        debug!("port {} not part of Linux bridge {}", iface, bridge);
        host.run(&format!("ip link set dev {iface} nomaster"), true)
            .await?;
        host.run(&format!("brctl addif {bridge} {iface}"), true)
            .await?;
    }

    let current = membership_vids(
        &host
            .run(&format!("bridge vlan show dev {iface}"), false)
            .await?
            .stdout,
    );
    let desired: Vec<u16> = mode.map(VlanMode::vids).unwrap_or_default();
    let current_set = vid_set(&current);
    let desired_set = vid_set(&desired);

    for vid in current_set.difference(&desired_set) {
        info!("removing VLAN {} from {}", vid, iface);
        host.run(&format!("bridge vlan del vid {vid} dev {iface}"), true)
            .await?;
    }

    let Some(mode) = mode else {
        ledger.bridge(bridge).parents.remove(iface);
        return Ok(());
    };

    if current_set != desired_set {
        host.run(&format!("ip link set {bridge} type bridge vlan_filtering 1"), true)
            .await?;
        host.run(&format!("bridge vlan delete dev {iface} vid 1"), false)
            .await?;
        for vid in &desired {
            if current_set.contains(vid) {
                continue;
            }
            let mut cmd = format!("bridge vlan add dev {iface} vid {vid}");
            if matches!(mode, VlanMode::Access(_) | VlanMode::Native(_)) {
                cmd.push_str(" pvid untagged");
            }
            host.run(&cmd, true).await?;
        }
        info!("applied VLAN setting {:?} to port {}", mode, iface);
    }

    let cache = &mut ledger.bridge(bridge).parents;
    if cache.get(iface) != Some(mode) {
        cache.insert(iface.to_string(), mode.clone());
    }
    Ok(())
}

fn same_kind(a: &VlanMode, b: &VlanMode) -> bool {
    matches!(
        (a, b),
        (VlanMode::Access(_), VlanMode::Access(_))
            | (VlanMode::Trunk(_), VlanMode::Trunk(_))
            | (VlanMode::Native(_), VlanMode::Native(_))
    )
}

fn vid_set(vids: &[u16]) -> BTreeSet<u16> {
    vids.iter().copied().collect()
}

fn join_vids(vids: &[u16]) -> String {
    vids.iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Numbers out of an `ovs-vsctl get port … trunks|tag` value, e.g. `[100, 200]`.
fn column_vids(output: &str) -> Vec<u16> {
    let mut vids = Vec::new();
    let mut digits = String::new();
    for ch in output.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            digits.push(ch);
        } else if !digits.is_empty() {
            if let Ok(vid) = digits.parse() {
                vids.push(vid);
            }
            digits.clear();
        }
    }
    vids
}

/// VIDs out of `bridge vlan show dev …`, skipping the header line. Each
/// member line carries its VID as the last number.
fn membership_vids(output: &str) -> Vec<u16> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            line.split_whitespace()
                .filter_map(|token| token.parse::<u16>().ok())
                .last()
        })
        .collect()
}
