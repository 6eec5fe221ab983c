use tracing::debug;

use crate::config::{BridgeSpec, ContainerIfaceSpec, NetweaveConfig, VethPairSpec};
use crate::orchestrator::state::StateRef;
use crate::orchestrator::{bridge, container, parse_veth_map, veth, Error, VETH_PREFIX_MAX};

/// Errors surfaced over HTTP: payload rejections map to 400, apply failures
/// to 500.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Apply(#[from] Error),
}

/// Applies API mutations to the live host under the mutation lock and
/// records them into the desired-state document so the next reconcile cycle
/// sees them.
pub struct NetweaveApiService {
    pub state: StateRef,
}

impl NetweaveApiService {
    pub fn new(state: StateRef) -> Self {
        NetweaveApiService { state }
    }

    pub async fn add_bridge(&self, name: &str, spec: &BridgeSpec) -> Result<(), ApiError> {
        // one guard across validate, apply and merge, so two concurrent
        // mutations cannot both pass validation against the same snapshot
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        validate_bridge(&state.config, name, spec)?;
        bridge::ensure_bridge(&state.host, &mut state.ledger, state.backend, name, spec).await?;
        state.config.merge_bridge(name, spec);
        state.ledger.save()?;
        debug!("bridge {} merged into the desired state", name);
        Ok(())
    }

    pub async fn add_container_iface(
        &self,
        container: &str,
        spec: &ContainerIfaceSpec,
    ) -> Result<(), ApiError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        validate_container(&state.config, container, spec)?;
        container::ensure_container_iface(
            &state.host,
            &mut state.ledger,
            state.backend,
            container,
            spec,
        )
        .await?;
        state.config.merge_container_iface(container, spec);
        state.ledger.save()?;
        debug!("interface {} merged for container {}", spec.iface, container);
        Ok(())
    }

    pub async fn add_veth_pair(&self, prefix: &str, spec: &VethPairSpec) -> Result<(), ApiError> {
        validate_veth_pair(prefix, spec)?;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        veth::ensure_veth_pair(&state.host, &mut state.ledger, state.backend, prefix, spec)
            .await?;
        state.config.merge_veth_pair(prefix, spec);
        state.ledger.save()?;
        debug!("veth pair {} merged into the desired state", prefix);
        Ok(())
    }
}

fn validate_bridge(
    config: &NetweaveConfig,
    name: &str,
    spec: &BridgeSpec,
) -> Result<(), ApiError> {
    if name.is_empty() {
        return Err(ApiError::Validation("bridge name must not be empty".into()));
    }
    for parent in &spec.parents {
        if parent.iface.is_empty() {
            return Err(ApiError::Validation("parent iface must not be empty".into()));
        }
        parent
            .mode()
            .map_err(|err| ApiError::Validation(err.to_string()))?;
        // a parent belongs to at most one bridge
        for (other, other_spec) in &config.bridge {
            if other_spec.parents.iter().any(|p| p.iface == parent.iface) {
                return Err(ApiError::Validation(format!(
                    "parent {} is already attached to bridge {}",
                    parent.iface, other
                )));
            }
        }
    }
    Ok(())
}

fn validate_container(
    config: &NetweaveConfig,
    container: &str,
    spec: &ContainerIfaceSpec,
) -> Result<(), ApiError> {
    if container.is_empty() {
        return Err(ApiError::Validation("container name must not be empty".into()));
    }
    if spec.iface.is_empty() || spec.bridge.is_empty() {
        return Err(ApiError::Validation(
            "container interface needs both iface and bridge".into(),
        ));
    }
    spec.mode()
        .map_err(|err| ApiError::Validation(err.to_string()))?;
    if let Some(existing) = config.container.get(container) {
        if existing.iter().any(|c| c.iface == spec.iface) {
            return Err(ApiError::Validation(format!(
                "interface {} is already configured for container {}",
                spec.iface, container
            )));
        }
    }
    Ok(())
}

fn validate_veth_pair(prefix: &str, spec: &VethPairSpec) -> Result<(), ApiError> {
    if prefix.is_empty() || prefix.len() > VETH_PREFIX_MAX {
        return Err(ApiError::Validation(format!(
            "veth pair id {prefix:?} must be between 1 and {VETH_PREFIX_MAX} characters"
        )));
    }
    if spec.on.is_empty() {
        return Err(ApiError::Validation("veth pair needs a target bridge".into()));
    }
    if spec.trunk != "yes" && spec.trunk != "no" {
        return Err(ApiError::Validation(format!(
            "trunk must be \"yes\" or \"no\", got {:?}",
            spec.trunk
        )));
    }
    parse_veth_map(&spec.map, spec.trunk == "yes")
        .map_err(|err| ApiError::Validation(err.to_string()))?;
    Ok(())
}
