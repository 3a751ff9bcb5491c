//! Master Election Module
//!
//! Decides which single process in a fleet is the master and which are
//! slaves, using the atomic create of an ephemeral election node on the
//! coordination service. Every other process registers an ephemeral child
//! under the slaves root and keeps a watch on the election node so it can
//! claim the role the moment the master goes away.

mod context;
mod session;
mod registry;
mod claim;
mod watch_loop;
mod cluster;
mod manager;

pub use context::ElectionContext;
pub use session::SessionSupervisor;
pub use registry::{NodeRegistry, SlaveRegistry};
pub use claim::ElectionCore;
pub use watch_loop::WatchLoop;
pub use cluster::{ClusterSnapshot, ClusterView};
pub use manager::ElectionManager;

use serde::{Deserialize, Serialize};

/// Role transition published to the owning process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleOutcome {
    /// This process holds the election node
    Master,
    /// Another process holds the election node
    Slave,
    /// The session was lost; the role is unknown until reconnection
    Disconnected,
}

impl std::fmt::Display for RoleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleOutcome::Master => write!(f, "MASTER"),
            RoleOutcome::Slave => write!(f, "SLAVE"),
            RoleOutcome::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

/// Last known role of this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// No election has completed yet
    Unknown,
    Master,
    Slave,
    Disconnected,
}

impl From<RoleOutcome> for Role {
    fn from(outcome: RoleOutcome) -> Self {
        match outcome {
            RoleOutcome::Master => Role::Master,
            RoleOutcome::Slave => Role::Slave,
            RoleOutcome::Disconnected => Role::Disconnected,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Unknown => write!(f, "UNKNOWN"),
            Role::Master => write!(f, "MASTER"),
            Role::Slave => write!(f, "SLAVE"),
            Role::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}
