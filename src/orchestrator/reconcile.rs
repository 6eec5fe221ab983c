use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use super::ledger::Ledger;
use super::state::{NetweaveState, StateRef};
use super::{bridge, container, veth, Error, MAX_FAIL_COUNT};

pub const CYCLE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Converged,
    Failed,
    /// The failure bound was crossed; the process must go down so the
    /// container manager restarts it fresh.
    Fatal,
}

/// The convergence loop. Runs until the shutdown channel fires, which is
/// only checked at the inter-cycle sleep; a cycle in flight finishes first.
pub async fn run(state: StateRef, mut shutdown: watch::Receiver<bool>) {
    loop {
        let outcome = {
            let mut guard = state.lock().await;
            let result = run_cycle(&mut guard).await;
            let outcome = note_outcome(&mut guard.ledger, result);
            if let Err(err) = guard.ledger.save() {
                error!("failed to persist ledger: {}", err);
            }
            outcome
        };

        if outcome == CycleOutcome::Fatal {
            error!("reconciler keeps failing, exiting");
            std::process::exit(1);
        }

        tokio::select! {
            _ = tokio::time::sleep(CYCLE_INTERVAL) => {}
            _ = shutdown.changed() => {
                info!("reconciler cancelled, shutting down gracefully");
                return;
            }
        }
    }
}

/// One pass over the desired state: bridges first, then the containers that
/// reference them, veth pairs last.
pub async fn run_cycle(state: &mut NetweaveState) -> Result<(), Error> {
    let config = state.config.clone();

    for (name, spec) in &config.bridge {
        bridge::ensure_bridge(&state.host, &mut state.ledger, state.backend, name, spec).await?;
    }

    for (name, ifaces) in &config.container {
        for spec in ifaces {
            container::ensure_container_iface(
                &state.host,
                &mut state.ledger,
                state.backend,
                name,
                spec,
            )
            .await?;
        }
    }

    for (prefix, spec) in &config.veth_pairs {
        veth::ensure_veth_pair(&state.host, &mut state.ledger, state.backend, prefix, spec)
            .await?;
    }
    Ok(())
}

/// Failure accounting: any failed cycle bumps the persistent counter, a
/// clean one resets it.
pub fn note_outcome(ledger: &mut Ledger, result: Result<(), Error>) -> CycleOutcome {
    match result {
        Ok(()) => {
            if ledger.failed != 0 {
                debug!("cycle converged, resetting failure counter");
                ledger.failed = 0;
            }
            CycleOutcome::Converged
        }
        Err(err) => {
            error!("reconcile cycle failed: {}", err);
            ledger.failed += 1;
            if ledger.failed > MAX_FAIL_COUNT {
                CycleOutcome::Fatal
            } else {
                CycleOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetweaveConfig;
    use crate::orchestrator::host::Host;
    use crate::orchestrator::testing::{scripted_host, ScriptedRunner};
    use crate::orchestrator::Backend;
    use std::sync::Arc;

    fn state_with(config: &str, host: Host) -> NetweaveState {
        NetweaveState::new(
            serde_json::from_str::<NetweaveConfig>(config).unwrap(),
            Ledger::default(),
            host,
            Backend::Ovs,
        )
    }

    fn converged_runner() -> (Arc<ScriptedRunner>, Host) {
        let (runner, host) = scripted_host();
        runner.respond("ovs-vsctl br-exists br0", 0, "");
        runner.respond("docker ps -f name=^c1$ -q", 0, "");
        runner.respond("ip link show v0_vmap1", 0, "17: v0_vmap1@v1_vmap1: <UP>");
        runner.respond("ovs-vsctl port-to-br v0_vmap1", 0, "br0\n");
        (runner, host)
    }

    const FULL_CONFIG: &str = r#"{
        "bridge": {"br0": {}},
        "container": {"c1": [{"bridge": "br0", "iface": "eth0"}]},
        "veth_pairs": {"vmap1": {"on": "br0", "map": ":"}}
    }"#;

    #[tokio::test]
    async fn a_cycle_walks_bridges_then_containers_then_veths() {
        let (runner, host) = converged_runner();
        let mut state = state_with(FULL_CONFIG, host);

        run_cycle(&mut state).await.unwrap();

        let commands = runner.commands();
        let pos = |needle: &str| {
            commands
                .iter()
                .position(|c| c == needle)
                .unwrap_or_else(|| panic!("missing command: {needle}"))
        };
        assert!(pos("ovs-vsctl br-exists br0") < pos("docker ps -f name=^c1$ -q"));
        assert!(pos("docker ps -f name=^c1$ -q") < pos("ip link show v0_vmap1"));
    }

    #[tokio::test]
    async fn a_failing_command_aborts_the_cycle() {
        let (runner, host) = scripted_host();
        runner.respond("ovs-vsctl br-exists br0", 2, "");
        runner.respond("ip link show dev br0", 1, "");
        runner.respond("ovs-vsctl --may-exist add-br br0", 1, "");

        let mut state = state_with(FULL_CONFIG, host);
        let err = run_cycle(&mut state).await.unwrap_err();
        assert!(matches!(err, Error::CommandFailed { .. }));
        // the cycle stopped before touching containers
        assert!(!runner.ran("docker ps -f name=^c1$ -q"));
    }

    #[tokio::test]
    async fn mutations_from_one_cycle_are_visible_to_the_next() {
        let (_, host) = converged_runner();
        let mut state = state_with(FULL_CONFIG, host);
        state
            .config
            .bridge
            .get_mut("br0")
            .unwrap()
            .iprange = Some("10.1.0.0/24".to_string());

        run_cycle(&mut state).await.unwrap();
        assert_eq!(
            state.ledger.bridge("br0").iprange.as_deref(),
            Some("10.1.0.0/24")
        );
    }

    #[test]
    fn the_failure_bound_is_crossed_on_the_third_consecutive_failure() {
        let mut ledger = Ledger::default();
        let fail = || {
            Err(Error::Validation("boom".to_string()))
        };

        assert_eq!(note_outcome(&mut ledger, fail()), CycleOutcome::Failed);
        assert_eq!(note_outcome(&mut ledger, fail()), CycleOutcome::Failed);
        assert_eq!(note_outcome(&mut ledger, fail()), CycleOutcome::Fatal);
        assert_eq!(ledger.failed, 3);
    }

    #[test]
    fn a_clean_cycle_resets_the_failure_counter() {
        let mut ledger = Ledger::default();
        ledger.failed = 2;
        assert_eq!(note_outcome(&mut ledger, Ok(())), CycleOutcome::Converged);
        assert_eq!(ledger.failed, 0);
    }

    #[test]
    fn the_counter_survives_through_the_persistent_ledger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.json");

        let mut ledger = Ledger::load(&path).unwrap();
        note_outcome(&mut ledger, Err(Error::Validation("boom".to_string())));
        ledger.save().unwrap();

        let mut reloaded = Ledger::load(&path).unwrap();
        assert_eq!(reloaded.failed, 1);
        note_outcome(&mut reloaded, Err(Error::Validation("boom".to_string())));
        note_outcome(&mut reloaded, Err(Error::Validation("boom".to_string())));
        assert_eq!(
            note_outcome(&mut reloaded, Err(Error::Validation("x".to_string()))),
            CycleOutcome::Fatal
        );
    }
}
