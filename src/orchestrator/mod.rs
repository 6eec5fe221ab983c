pub mod bridge;
pub mod container;
pub mod host;
pub mod ledger;
pub mod reconcile;
pub mod state;
pub mod veth;

use std::fmt;
use std::io;

use thiserror::Error;

pub use veth::parse_veth_map;

/// Consecutive failing cycles tolerated before the process gives up.
pub const MAX_FAIL_COUNT: u32 = 2;

/// Veth pair names are derived as `v0_<prefix>` / `v1_<prefix>`; the kernel
/// caps interface names at 15 bytes, which bounds the prefix.
pub const VETH_PREFIX_MAX: usize = 8;

/// Which datapath implementation owns the bridges on this host.
///
/// Process-wide choice, made once at startup from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Ovs,
    Linux,
}

impl Backend {
    pub fn from_env() -> Self {
        match std::env::var("USE_LINUX_BRIDGE").as_deref() {
            Ok("true") | Ok("1") => Backend::Linux,
            _ => Backend::Ovs,
        }
    }

    /// Helper binary that pushes a veth end into a container namespace.
    pub fn docker_util(self) -> &'static str {
        match self {
            Backend::Ovs => "ovs-docker",
            Backend::Linux => "lxbr-docker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub const BOTH: [Family; 2] = [Family::V4, Family::V6];

    /// Flag understood by `ip` for family-scoped operations.
    pub fn flag(self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }

    /// Address option of the docker attach helpers.
    pub fn addr_flag(self) -> &'static str {
        match self {
            Family::V4 => "--ipaddress",
            Family::V6 => "--ip6address",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("command `{command}` exited with {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: io::Error,
    },
    #[error("{0}")]
    BadAddress(String),
    #[error("address {addr} already allocated to someone else on bridge {bridge}")]
    AddressConflict { bridge: String, addr: String },
    #[error("{addr} does not fall under the range {range}")]
    OutOfRange { addr: String, range: String },
    #[error("bridge {bridge} has no {family} range defined")]
    NoRange { bridge: String, family: Family },
    #[error("no free {family} address left in {range} on bridge {bridge}")]
    RangeExhausted {
        bridge: String,
        range: String,
        family: Family,
    },
    #[error("veth prefix {0} cannot be more than {VETH_PREFIX_MAX} characters")]
    BadPrefix(String),
    #[error("{0}")]
    Validation(String),
    #[error("ledger io error")]
    Io(#[from] io::Error),
    #[error("ledger serialization error")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}
