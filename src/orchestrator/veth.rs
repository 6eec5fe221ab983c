use tracing::{debug, info};

use crate::config::{parse_vids, VethPairSpec, VlanMode};

use super::host::Host;
use super::ledger::Ledger;
use super::{bridge, Backend, Error, VETH_PREFIX_MAX};

/// Split a `source:dest` VLAN translation map into per-end modes. An empty
/// segment yields no mode: an untagged first end, a dangling second end.
pub fn parse_veth_map(
    map: &str,
    trunk: bool,
) -> Result<(Option<VlanMode>, Option<VlanMode>), Error> {
    let Some((source, dest)) = map.split_once(':') else {
        return Err(Error::validation(format!(
            "vlan map {map:?} must use the source:dest form"
        )));
    };
    Ok((segment_mode(source, trunk)?, segment_mode(dest, trunk)?))
}

fn segment_mode(vids: &str, trunk: bool) -> Result<Option<VlanMode>, Error> {
    if vids.is_empty() {
        return Ok(None);
    }
    if trunk {
        return Ok(Some(VlanMode::Trunk(parse_vids(vids)?)));
    }
    let parsed = parse_vids(vids)?;
    if parsed.len() != 1 {
        return Err(Error::validation(format!(
            "access VLAN {vids} must be a single id"
        )));
    }
    Ok(Some(VlanMode::Access(parsed[0])))
}

/// Create the `v0_<prefix>` / `v1_<prefix>` pair if needed and attach its
/// ends to the bridge according to the VLAN translation map. An empty dest
/// segment leaves `v1` dangling.
pub async fn ensure_veth_pair(
    host: &Host,
    ledger: &mut Ledger,
    backend: Backend,
    prefix: &str,
    spec: &VethPairSpec,
) -> Result<(), Error> {
    if prefix.len() > VETH_PREFIX_MAX {
        return Err(Error::BadPrefix(prefix.to_string()));
    }
    let (source_mode, dest_mode) = parse_veth_map(&spec.map, spec.trunk == "yes")?;

    let veth0 = format!("v0_{prefix}");
    let veth1 = format!("v1_{prefix}");
    debug!("veth pair entry: {} <--> {}", veth0, veth1);

    // Checking one end is enough: the pair is created in a single command,
    // so either both ends exist or neither does.
    if !host.link_exists(&veth0).await? {
        host.run(&format!("ip link add {veth0} type veth peer name {veth1}"), true)
            .await?;
        host.run(&format!("ip link set dev {veth0} up"), true).await?;
        host.run(&format!("ip link set dev {veth1} up"), true).await?;
        info!("veth pair created: {} <--> {}", veth0, veth1);
    } else {
        debug!("veth pair {} <--> {} exists on the host", veth0, veth1);
    }

    debug!("vlan mapping {} on {}", spec.map, spec.on);
    bridge::attach_iface(host, ledger, backend, &spec.on, &veth0, source_mode.as_ref()).await?;
    info!("veth {} attached to bridge {}", veth0, spec.on);

    match dest_mode {
        None => info!("veth {} is dangling", veth1),
        Some(mode) => {
            bridge::attach_iface(host, ledger, backend, &spec.on, &veth1, Some(&mode)).await?;
            info!("veth {} attached to bridge {}", veth1, spec.on);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::scripted_host;

    fn pair(on: &str, map: &str, trunk: &str) -> VethPairSpec {
        VethPairSpec {
            on: on.to_string(),
            map: map.to_string(),
            trunk: trunk.to_string(),
        }
    }

    #[tokio::test]
    async fn rejects_prefixes_longer_than_eight_chars() {
        let (_, host) = scripted_host();
        let mut ledger = Ledger::default();
        let err = ensure_veth_pair(
            &host,
            &mut ledger,
            Backend::Ovs,
            "123456789",
            &pair("br0", ":", "no"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::BadPrefix(_)));
    }

    #[tokio::test]
    async fn eight_char_prefix_is_accepted() {
        let (runner, host) = scripted_host();
        runner.respond("ip link show v0_12345678", 1, "");
        let mut ledger = Ledger::default();
        ensure_veth_pair(
            &host,
            &mut ledger,
            Backend::Ovs,
            "12345678",
            &pair("br0", ":", "no"),
        )
        .await
        .unwrap();
        assert!(runner.ran("ip link add v0_12345678 type veth peer name v1_12345678"));
    }

    #[tokio::test]
    async fn pair_is_created_and_both_ends_come_up() {
        let (runner, host) = scripted_host();
        runner.respond("ip link show v0_vmap1", 1, "");

        let mut ledger = Ledger::default();
        ensure_veth_pair(
            &host,
            &mut ledger,
            Backend::Ovs,
            "vmap1",
            &pair("br0", ":", "no"),
        )
        .await
        .unwrap();

        let commands = runner.commands();
        let pos = |needle: &str| {
            commands
                .iter()
                .position(|c| c == needle)
                .unwrap_or_else(|| panic!("missing command: {needle}"))
        };
        assert!(pos("ip link add v0_vmap1 type veth peer name v1_vmap1") < pos("ip link set dev v0_vmap1 up"));
        assert!(pos("ip link set dev v0_vmap1 up") < pos("ip link set dev v1_vmap1 up"));
    }

    #[tokio::test]
    async fn existing_pair_is_not_recreated() {
        let (runner, host) = scripted_host();
        runner.respond("ip link show v0_vmap1", 0, "17: v0_vmap1@v1_vmap1: <UP>");

        let mut ledger = Ledger::default();
        ensure_veth_pair(
            &host,
            &mut ledger,
            Backend::Ovs,
            "vmap1",
            &pair("br0", ":", "no"),
        )
        .await
        .unwrap();

        assert!(!runner.commands().iter().any(|c| c.starts_with("ip link add")));
    }

    #[tokio::test]
    async fn empty_dest_leaves_the_second_end_dangling() {
        let (runner, host) = scripted_host();
        runner.respond("ip link show v0_vmap1", 1, "");

        let mut ledger = Ledger::default();
        ensure_veth_pair(
            &host,
            &mut ledger,
            Backend::Ovs,
            "vmap1",
            &pair("br0", "10:", "no"),
        )
        .await
        .unwrap();

        assert!(runner.ran("ovs-vsctl set port v0_vmap1 tag=10"));
        // the second end only ever shows up in creation and link-up commands
        assert!(!runner
            .commands()
            .iter()
            .any(|c| c.contains("v1_vmap1") && !c.starts_with("ip link")));
    }

    #[tokio::test]
    async fn translation_map_tags_both_ends() {
        let (runner, host) = scripted_host();
        runner.respond("ip link show v0_vmap1", 1, "");

        let mut ledger = Ledger::default();
        ensure_veth_pair(
            &host,
            &mut ledger,
            Backend::Ovs,
            "vmap1",
            &pair("br0", "2005:100", "no"),
        )
        .await
        .unwrap();

        assert!(runner.ran("ovs-vsctl --may-exist add-port br0 v0_vmap1"));
        assert!(runner.ran("ovs-vsctl --may-exist add-port br0 v1_vmap1"));
        assert!(runner.ran("ovs-vsctl set port v0_vmap1 tag=2005"));
        assert!(runner.ran("ovs-vsctl set port v1_vmap1 tag=100"));
    }

    #[tokio::test]
    async fn trunk_map_applies_trunk_lists() {
        let (runner, host) = scripted_host();
        runner.respond("ip link show v0_vmap1", 1, "");

        let mut ledger = Ledger::default();
        ensure_veth_pair(
            &host,
            &mut ledger,
            Backend::Ovs,
            "vmap1",
            &pair("br0", "100,200:300", "yes"),
        )
        .await
        .unwrap();

        assert!(runner.ran("ovs-vsctl set port v0_vmap1 trunks=100,200"));
        assert!(runner.ran("ovs-vsctl set port v1_vmap1 trunks=300"));
    }

    #[tokio::test]
    async fn map_without_a_colon_is_rejected() {
        let (runner, host) = scripted_host();
        runner.respond("ip link show v0_vmap1", 0, "17: v0_vmap1@v1_vmap1: <UP>");

        let mut ledger = Ledger::default();
        let err = ensure_veth_pair(
            &host,
            &mut ledger,
            Backend::Ovs,
            "vmap1",
            &pair("br0", "10", "no"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
