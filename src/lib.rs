//! Shepherd - Master/Slave Election on a Coordination Service
//!
//! Decides which single process in a fleet of otherwise independent
//! processes is the master and which are slaves, using the atomic create and
//! one-shot watch primitives of a ZooKeeper-style coordination service, and
//! keeps that decision correct across crashes, partitions and session expiry.
//!
//! # Architecture
//!
//! Every process runs an [`ElectionManager`](election::ElectionManager).
//! The master holds an ephemeral election node carrying its identity; every
//! other process registers an ephemeral child under the slaves root and
//! watches the election node. When the master's session ends the service
//! removes its node, the watchers fire and exactly one survivor wins the
//! next create.
//!
//! # Features
//!
//! - Race-free election built only on the service's atomic create
//! - Session supervision with reconnect and re-election
//! - Role outcomes (master, slave, disconnected) delivered on a channel
//! - Cluster membership snapshots
//! - ZooKeeper backend, plus an in-process ensemble for tests and simulation

pub mod config;
pub mod coord;
pub mod election;
pub mod error;
pub mod identity;

pub use config::ShepherdConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ShepherdConfig;
    pub use crate::coord::{
        Connector, MemoryEnsemble, Session, SessionId, SessionState, ZooKeeperConnector,
    };
    pub use crate::election::{ClusterSnapshot, ElectionManager, Role, RoleOutcome};
    pub use crate::error::{Error, Result};
}
