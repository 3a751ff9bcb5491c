//! Node registry
//!
//! Thin layer over a session's node operations. Absent nodes come back as
//! `None` instead of an error, which is how the election and cluster view
//! consume them.

use crate::coord::{parent_path, CreateMode, Session};
use crate::error::{Error, Result};

/// Read/create/delete against the node tree through one session
pub struct NodeRegistry<'a> {
    session: &'a dyn Session,
}

impl<'a> NodeRegistry<'a> {
    pub fn new(session: &'a dyn Session) -> Self {
        Self { session }
    }

    /// Payload of a node, or `None` if it does not exist
    pub async fn get_node_data(&self, path: &str) -> Result<Option<String>> {
        match self.session.get_data(path).await {
            Ok(data) => Ok(Some(String::from_utf8_lossy(&data).into_owned())),
            Err(Error::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create a node; `Error::NodeExists` is passed through untouched
    pub async fn create_node(&self, path: &str, data: &str, mode: CreateMode) -> Result<String> {
        self.session.create(path, data.as_bytes(), mode).await
    }

    /// Delete a node; returns false if it was already gone
    pub async fn delete_node(&self, path: &str) -> Result<bool> {
        match self.session.delete(path).await {
            Ok(()) => Ok(true),
            Err(Error::NoNode(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Children of a node, or `None` if it does not exist
    pub async fn list_children(&self, path: &str) -> Result<Option<Vec<String>>> {
        match self.session.children(path).await {
            Ok(children) => Ok(Some(children)),
            Err(Error::NoNode(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Create every missing persistent node along a path
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        if path == "/" {
            return Ok(());
        }

        let mut missing = Vec::new();
        let mut current = path;
        while current != "/" && self.get_node_data(current).await?.is_none() {
            missing.push(current);
            current = match parent_path(current) {
                Some(parent) => parent,
                None => break,
            };
        }

        for node in missing.into_iter().rev() {
            match self.create_node(node, "", CreateMode::Persistent).await {
                Ok(created) => tracing::info!(func = "ensure_path", "node directory created: {}", created),
                Err(Error::NodeExists(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Create the persistent parents of a node
    pub async fn ensure_parent(&self, path: &str) -> Result<()> {
        match parent_path(path) {
            Some(parent) => self.ensure_path(parent).await,
            None => Ok(()),
        }
    }
}

/// Membership directory of non-master processes
pub struct SlaveRegistry<'a> {
    registry: &'a NodeRegistry<'a>,
    slaves_root: &'a str,
}

impl<'a> SlaveRegistry<'a> {
    pub fn new(registry: &'a NodeRegistry<'a>, slaves_root: &'a str) -> Self {
        Self { registry, slaves_root }
    }

    /// Path of an identity's registration node
    pub fn slave_node(&self, identity: &str) -> String {
        format!("{}/{}", self.slaves_root, identity)
    }

    /// Register an identity as a slave; a second call is a no-op
    pub async fn register(&self, identity: &str) -> Result<()> {
        if self.registry.get_node_data(self.slaves_root).await?.is_none() {
            self.registry.ensure_path(self.slaves_root).await.map_err(|e| {
                tracing::error!(func = "register", "error creating slave node directory: {}", e);
                e
            })?;
        }

        let slave_node = self.slave_node(identity);
        if self.registry.get_node_data(&slave_node).await?.is_some() {
            tracing::info!(func = "register", "slave node already exists: {}", slave_node);
            return Ok(());
        }

        match self
            .registry
            .create_node(&slave_node, identity, CreateMode::Ephemeral)
            .await
        {
            Ok(path) => {
                tracing::info!(func = "register", "slave node created: {}", path);
                Ok(())
            }
            Err(Error::NodeExists(_)) => {
                tracing::info!(func = "register", "slave node already exists: {}", slave_node);
                Ok(())
            }
            Err(e) => {
                tracing::error!(func = "register", "error creating a slave node: {}", e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{Connector, MemoryEnsemble};
    use std::sync::Arc;
    use std::time::Duration;

    async fn session(ensemble: &MemoryEnsemble) -> Arc<dyn Session> {
        ensemble
            .connect(&["memory:2181".to_string()], Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_absent_node_is_none() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        let registry = NodeRegistry::new(s.as_ref());

        assert_eq!(registry.get_node_data("/master").await.unwrap(), None);
        assert_eq!(registry.list_children("/slaves").await.unwrap(), None);
        assert!(!registry.delete_node("/master").await.unwrap());

        registry.create_node("/master", "n1", CreateMode::Ephemeral).await.unwrap();
        assert_eq!(registry.get_node_data("/master").await.unwrap().as_deref(), Some("n1"));
        assert!(registry.delete_node("/master").await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_path_is_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        let registry = NodeRegistry::new(s.as_ref());

        registry.ensure_path("/services/search/slaves").await.unwrap();
        registry.ensure_path("/services/search/slaves").await.unwrap();
        registry.ensure_parent("/services/search/master").await.unwrap();

        assert_eq!(
            registry.list_children("/services/search").await.unwrap(),
            Some(vec!["slaves".to_string()])
        );
        assert_eq!(ensemble.node_count().await, 3);
    }

    #[tokio::test]
    async fn test_register_twice_leaves_one_child() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        let registry = NodeRegistry::new(s.as_ref());
        let slaves = SlaveRegistry::new(&registry, "/slaves");

        slaves.register("n2").await.unwrap();
        slaves.register("n2").await.unwrap();

        assert_eq!(ensemble.children_of("/slaves").await, vec!["n2".to_string()]);
        assert_eq!(ensemble.node_data("/slaves/n2").await.as_deref(), Some("n2"));
        assert_eq!(ensemble.ephemeral_owner("/slaves/n2").await, Some(s.id()));
        assert_eq!(ensemble.ephemeral_owner("/slaves").await, None);
    }

    #[tokio::test]
    async fn test_register_keeps_other_identities() {
        let ensemble = MemoryEnsemble::new();
        let s2 = session(&ensemble).await;
        let s3 = session(&ensemble).await;

        let r2 = NodeRegistry::new(s2.as_ref());
        let r3 = NodeRegistry::new(s3.as_ref());
        SlaveRegistry::new(&r2, "/slaves").register("n2").await.unwrap();
        SlaveRegistry::new(&r3, "/slaves").register("n3").await.unwrap();

        assert_eq!(
            ensemble.children_of("/slaves").await,
            vec!["n2".to_string(), "n3".to_string()]
        );
        assert_eq!(ensemble.ephemeral_owner("/slaves/n2").await, Some(s2.id()));
    }
}
