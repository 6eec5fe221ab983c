use tracing::{debug, info};

use crate::config::{ContainerIfaceSpec, VlanMode};

use super::host::Host;
use super::ledger::{IfaceFacts, Ledger};
use super::{Backend, Error, Family};

/// Literal address value that opts a family out of assignment.
pub const NO_IP: &str = "No-IP";

/// Attach one container interface to its bridge, allocating addresses as
/// needed. A container that does not exist yet is skipped until a later
/// cycle picks it up.
pub async fn ensure_container_iface(
    host: &Host,
    ledger: &mut Ledger,
    backend: Backend,
    container: &str,
    spec: &ContainerIfaceSpec,
) -> Result<(), Error> {
    let util = backend.docker_util();
    let bridge = &spec.bridge;
    let iface = &spec.iface;
    let mode = spec.mode()?;

    if !host.docker_exists(container).await? {
        return Ok(());
    }
    if iface_registered(host, util, bridge, container, iface).await? {
        return Ok(());
    }

    let mut cmd = format!("{util} add-port {bridge} {iface} {container}");
    let mut facts = IfaceFacts::default();

    for family in Family::BOTH {
        let spec_addr = match family {
            Family::V4 => &spec.ipaddress,
            Family::V6 => &spec.ip6address,
        };
        match spec_addr.as_deref() {
            None => {
                // No address requested: hand one out when the bridge has a
                // range to allocate from.
                if ledger.bridge(bridge).range(family).is_some() {
                    let addr = ledger.auto_allocate(bridge, container, family)?;
                    cmd.push_str(&format!(" {}={}", family.addr_flag(), addr));
                    facts.set_addr(family, addr);
                }
            }
            Some(NO_IP) => {}
            Some(addr) => {
                if !addr.contains('/') {
                    return Err(Error::BadAddress(format!(
                        "{container}: ip {addr} must have a prefix mask"
                    )));
                }
                let entry = ledger.bridge(bridge);
                if entry.hosts(family).get(container).map(String::as_str) != Some(addr) {
                    entry.hosts_mut(family).remove(container);
                    if entry.reserved_by_other(family, container, addr) {
                        return Err(Error::AddressConflict {
                            bridge: bridge.clone(),
                            addr: addr.to_string(),
                        });
                    }
                }
                entry
                    .hosts_mut(family)
                    .insert(container.to_string(), addr.to_string());
                cmd.push_str(&format!(" {}={}", family.addr_flag(), addr));
                facts.set_addr(family, addr.to_string());
            }
        }
    }

    if let Some(mac) = &spec.macaddress {
        cmd.push_str(&format!(" --macaddress={mac}"));
    }
    if let Some(gateway) = &spec.gateway {
        cmd.push_str(&format!(" --gateway={gateway}"));
    }
    if let Some(gateway6) = &spec.gateway6 {
        cmd.push_str(&format!(" --gateway6={gateway6}"));
    }

    host.run(&cmd, true).await?;
    info!(
        "interface {} connected to bridge {} added to container {}",
        iface, bridge, container
    );

    if let Some(mode) = &mode {
        let (subcmd, arg) = match mode {
            VlanMode::Access(vid) => ("set-vlan", vid.to_string()),
            VlanMode::Trunk(_) => ("set-trunk", mode.vid_arg()),
            // mode() already refused native for containers
            VlanMode::Native(_) => return Ok(()),
        };
        host.run(
            &format!("{util} {subcmd} {bridge} {iface} {container} {arg}"),
            true,
        )
        .await?;
        info!("{} set for {}:{} is {}", subcmd, container, iface, arg);
        facts.vlan = Some(mode.clone());
    }

    ledger
        .bridge(bridge)
        .containers
        .entry(container.to_string())
        .or_default()
        .insert(iface.clone(), facts);
    Ok(())
}

/// Probe whether `(container, iface)` is already fully attached. An
/// interface present inside the container without a registered bridge port
/// is a leftover from a previous run and gets deleted; partial helper state
/// is cleared either way.
async fn iface_registered(
    host: &Host,
    util: &str,
    bridge: &str,
    container: &str,
    iface: &str,
) -> Result<bool, Error> {
    if host.docker_has_iface(container, iface).await? {
        debug!("interface {} exists inside container {}", iface, container);
        let port = host
            .run(&format!("{util} get-port {container} {iface}"), false)
            .await?;
        if !port.stdout.trim().is_empty() {
            debug!("interface {} registered on bridge", iface);
            return Ok(true);
        }
        debug!(
            "interface {} exists inside container {} but not on the bridge, removing",
            iface, container
        );
        host.run(&format!("docker exec {container} ip link del {iface}"), false)
            .await?;
    }

    info!("container {} is missing interface {}", container, iface);
    host.run(&format!("{util} del-port {bridge} {iface} {container}"), false)
        .await?;
    Ok(false)
}
