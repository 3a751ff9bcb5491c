//! Master claim
//!
//! The election itself: read the election node, try to create it when it is
//! absent, and otherwise settle as master (payload is ours) or slave
//! (payload belongs to someone else). Concurrent claimants converge on a
//! single master because the coordination service's create is atomic; no
//! local lock takes part in the decision.

use std::sync::Arc;

use super::registry::{NodeRegistry, SlaveRegistry};
use super::{ElectionContext, RoleOutcome};
use crate::coord::CreateMode;
use crate::error::{Error, Result};

/// How often a single claim re-reads the election node after losing a create
/// race before giving up until the next trigger
const CLAIM_ATTEMPTS: usize = 3;

/// Runs the claim algorithm against the current session
pub struct ElectionCore {
    ctx: Arc<ElectionContext>,
}

impl ElectionCore {
    pub fn new(ctx: Arc<ElectionContext>) -> Self {
        Self { ctx }
    }

    /// Try to elect this process as the master
    ///
    /// Safe to call redundantly: an existing election node carrying this
    /// identity is recognised and nothing is created twice.
    pub async fn elect_for_master(&self) -> Result<RoleOutcome> {
        let session = self.ctx.current_session().await?;
        let registry = NodeRegistry::new(session.as_ref());
        let election_node = self.ctx.config().election.election_node.as_str();
        let identity = self.ctx.identity();

        for _ in 0..CLAIM_ATTEMPTS {
            let current = registry.get_node_data(election_node).await.map_err(|e| {
                tracing::error!(func = "elect_for_master", "error retrieving election node data: {}", e);
                e
            })?;

            if let Some(master) = current {
                return self.settle(&registry, &master).await;
            }

            registry.ensure_parent(election_node).await?;

            match registry
                .create_node(election_node, identity, CreateMode::Ephemeral)
                .await
            {
                Ok(path) => {
                    tracing::info!(func = "elect_for_master", "master node created: {}", path);
                    self.ctx.transition(RoleOutcome::Master).await;
                    self.remove_stale_slave(&registry).await;
                    return Ok(RoleOutcome::Master);
                }
                Err(Error::NodeExists(_)) => {
                    tracing::info!(func = "elect_for_master", "some node became master before this node");
                }
                Err(e) => {
                    tracing::error!(func = "elect_for_master", "error creating election node: {}", e);
                    return Err(e);
                }
            }
        }

        Err(Error::Internal(format!(
            "election node {} changed hands {} times during one claim",
            election_node, CLAIM_ATTEMPTS
        )))
    }

    /// The election node exists: decide between master and slave
    async fn settle(&self, registry: &NodeRegistry<'_>, master: &str) -> Result<RoleOutcome> {
        let identity = self.ctx.identity();

        if master == identity {
            tracing::info!(func = "elect_for_master", "this node is the master: {}", master);
            self.ctx.transition(RoleOutcome::Master).await;
            self.remove_stale_slave(registry).await;
            return Ok(RoleOutcome::Master);
        }

        tracing::info!(func = "elect_for_master", "another node is the master: {}", master);
        let slaves = SlaveRegistry::new(registry, &self.ctx.config().election.slaves_root);
        slaves.register(identity).await?;
        self.ctx.transition(RoleOutcome::Slave).await;

        Ok(RoleOutcome::Slave)
    }

    /// Drop a slave registration left over from before this process became master
    async fn remove_stale_slave(&self, registry: &NodeRegistry<'_>) {
        let slave_node = self.ctx.config().slave_node(self.ctx.identity());

        match registry.delete_node(&slave_node).await {
            Ok(true) => tracing::info!(func = "elect_for_master", "slave node deleted: {}", slave_node),
            Ok(false) => {}
            Err(e) => tracing::error!(
                func = "elect_for_master",
                "error deleting slave node '{}': {}",
                slave_node,
                e
            ),
        }
    }
}
