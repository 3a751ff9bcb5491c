//! Cluster view
//!
//! Point-in-time membership read straight from the node tree. The master
//! and the slave list come from two separate reads, so a role change landing
//! between them can show the new master still listed as a slave; treat a
//! snapshot as advisory.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::registry::NodeRegistry;
use super::{ElectionContext, Role};
use crate::error::Result;

/// Membership snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    /// Whether the reading process was master when the snapshot was taken
    pub is_master: bool,
    /// Identity holding the election node, if any
    pub master: Option<String>,
    /// Identities registered as slaves
    pub slaves: BTreeSet<String>,
    /// Master first, then slaves
    pub nodes: Vec<String>,
    /// Master (if present) plus slave count
    pub num_nodes: usize,
    /// When the snapshot was read
    pub taken_at: DateTime<Utc>,
}

impl ClusterSnapshot {
    fn new(is_master: bool, master: Option<String>, slaves: BTreeSet<String>) -> Self {
        let nodes: Vec<String> = master.iter().chain(slaves.iter()).cloned().collect();

        Self {
            is_master,
            num_nodes: nodes.len(),
            master,
            slaves,
            nodes,
            taken_at: Utc::now(),
        }
    }
}

/// Reads cluster membership on demand
pub struct ClusterView {
    ctx: Arc<ElectionContext>,
}

impl ClusterView {
    pub fn new(ctx: Arc<ElectionContext>) -> Self {
        Self { ctx }
    }

    /// Read the current master and slaves; never cached
    pub async fn get_cluster_info(&self) -> Result<ClusterSnapshot> {
        let session = self.ctx.current_session().await?;
        let registry = NodeRegistry::new(session.as_ref());
        let election = &self.ctx.config().election;

        let master = registry.get_node_data(&election.election_node).await.map_err(|e| {
            tracing::error!(func = "get_cluster_info", "error retrieving election node data: {}", e);
            e
        })?;

        let slaves: BTreeSet<String> = registry
            .list_children(&election.slaves_root)
            .await
            .map_err(|e| {
                tracing::error!(func = "get_cluster_info", "error getting slave nodes: {}", e);
                e
            })?
            .unwrap_or_default()
            .into_iter()
            .collect();

        let is_master = self.ctx.role().await == Role::Master;
        let snapshot = ClusterSnapshot::new(is_master, master, slaves);

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                func = "get_cluster_info",
                "cluster: master={} nodes=[{}]",
                snapshot.master.as_deref().unwrap_or("-"),
                snapshot.nodes.join(",")
            );
        }

        Ok(snapshot)
    }
}
