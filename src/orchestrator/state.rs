use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::NetweaveConfig;

use super::host::Host;
use super::ledger::Ledger;
use super::Backend;

/// The mutation lock: every writer (reconciler cycle, API mutation) holds it
/// for the whole of one operation.
pub type StateRef = Arc<Mutex<NetweaveState>>;

/// Single owner of all mutable state: the desired-state document, the
/// persistent ledger and the host driver.
pub struct NetweaveState {
    pub config: NetweaveConfig,
    pub ledger: Ledger,
    pub host: Host,
    pub backend: Backend,
}

impl NetweaveState {
    pub fn new(config: NetweaveConfig, ledger: Ledger, host: Host, backend: Backend) -> Self {
        NetweaveState {
            config,
            ledger,
            host,
            backend,
        }
    }
}
