//! In-Memory Coordination Ensemble
//!
//! A coordination service held entirely in process memory. Every session
//! handed out by one [`MemoryEnsemble`] shares the same node tree, so several
//! election managers in one process compete exactly as separate hosts would
//! against a real ensemble. All tree mutations happen under a single lock,
//! which is what makes create-if-absent atomic.
//!
//! The ensemble also exposes fault injection (expiry, dropped connections,
//! auth failure, unreachable endpoints) so session-loss paths can be driven
//! deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};

use super::{
    parent_path, validate_path, Connector, CreateMode, EventKind, NodeWatcher, Session,
    SessionId, SessionState, WatchEvent,
};
use crate::error::{Error, Result};

/// A node in the tree
#[derive(Debug, Clone)]
struct ZNode {
    data: Vec<u8>,
    ephemeral_owner: Option<SessionId>,
}

/// Fail unless a session in `state` can issue requests
fn check_state(id: SessionId, state: SessionState) -> Result<()> {
    match state {
        SessionState::Connected | SessionState::Authenticated => Ok(()),
        SessionState::Connecting | SessionState::Disconnected => {
            Err(Error::ConnectionLoss(id.to_string()))
        }
        SessionState::Expired => Err(Error::SessionExpired(id.to_string())),
        SessionState::AuthFailed => Err(Error::AuthFailed(id.to_string())),
        SessionState::Closed => Err(Error::SessionClosed(id.to_string())),
    }
}

/// Pending one-shot watch
struct PendingWatch {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

/// Shared tree and session table
struct Tree {
    nodes: BTreeMap<String, ZNode>,
    /// Live sessions only; an ended session's entry is dropped
    sessions: HashMap<SessionId, watch::Sender<SessionState>>,
    watches: HashMap<String, Vec<PendingWatch>>,
    next_session_id: u64,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            ZNode {
                data: Vec::new(),
                ephemeral_owner: None,
            },
        );

        Self {
            nodes,
            sessions: HashMap::new(),
            watches: HashMap::new(),
            next_session_id: 0,
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .map(|(key, _)| key.starts_with(&prefix))
            .unwrap_or(false)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect()
    }

    /// Deliver and drop every watch on a path
    fn fire(&mut self, path: &str, kind: EventKind) {
        if let Some(pending) = self.watches.remove(path) {
            for watch in pending {
                let _ = watch.tx.send(WatchEvent::node(kind, path));
            }
        }
    }

    /// Tear a session down: its watches learn the final state, its ephemerals go
    fn end_session(&mut self, id: SessionId, final_state: SessionState) -> bool {
        if !self.sessions.contains_key(&id) {
            return false;
        }

        for (path, pending) in self.watches.iter_mut() {
            let (dying, alive): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|w| w.session == id);
            *pending = alive;
            for watch in dying {
                let _ = watch.tx.send(WatchEvent::session(path, final_state));
            }
        }
        self.watches.retain(|_, pending| !pending.is_empty());

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();

        for path in owned {
            self.nodes.remove(&path);
            tracing::debug!(func = "end_session", session = %id, "ephemeral node reclaimed: {}", path);
            self.fire(&path, EventKind::NodeDeleted);
        }

        // receivers keep the final state after the sender is gone
        if let Some(tx) = self.sessions.remove(&id) {
            tx.send_replace(final_state);
        }

        true
    }

    fn set_state(&mut self, id: SessionId, from: fn(&SessionState) -> bool, to: SessionState) -> bool {
        match self.sessions.get(&id) {
            Some(tx) if from(&tx.borrow()) => {
                tx.send_replace(to);
                true
            }
            _ => false,
        }
    }
}

/// In-process coordination service
#[derive(Clone)]
pub struct MemoryEnsemble {
    tree: Arc<Mutex<Tree>>,
    reachable: Arc<AtomicBool>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Create an empty ensemble (only the root node exists)
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Make new connection attempts succeed or fail
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Expire a session; its ephemeral nodes are reclaimed
    pub async fn expire_session(&self, id: SessionId) -> bool {
        self.tree.lock().await.end_session(id, SessionState::Expired)
    }

    /// Reject a session's credentials; treated like expiry by the service
    pub async fn fail_auth(&self, id: SessionId) -> bool {
        self.tree.lock().await.end_session(id, SessionState::AuthFailed)
    }

    /// Drop a session's connection without ending it
    pub async fn drop_connection(&self, id: SessionId) -> bool {
        self.tree
            .lock()
            .await
            .set_state(id, SessionState::is_healthy, SessionState::Disconnected)
    }

    /// Bring a dropped connection back
    pub async fn restore_connection(&self, id: SessionId) -> bool {
        self.tree.lock().await.set_state(
            id,
            |state| *state == SessionState::Disconnected,
            SessionState::Connected,
        )
    }

    /// Sessions that have not been closed or expired
    pub async fn session_ids(&self) -> Vec<SessionId> {
        let tree = self.tree.lock().await;
        let mut ids: Vec<SessionId> = tree.sessions.keys().copied().collect();
        ids.sort();
        ids
    }

    /// State of a live session; `None` once it has ended
    pub async fn session_state(&self, id: SessionId) -> Option<SessionState> {
        let tree = self.tree.lock().await;
        tree.sessions.get(&id).map(|tx| *tx.borrow())
    }

    /// Payload of a node as text
    pub async fn node_data(&self, path: &str) -> Option<String> {
        let tree = self.tree.lock().await;
        tree.nodes
            .get(path)
            .map(|node| String::from_utf8_lossy(&node.data).into_owned())
    }

    /// Session owning an ephemeral node
    pub async fn ephemeral_owner(&self, path: &str) -> Option<SessionId> {
        let tree = self.tree.lock().await;
        tree.nodes.get(path).and_then(|node| node.ephemeral_owner)
    }

    /// Direct children of a node (empty if absent)
    pub async fn children_of(&self, path: &str) -> Vec<String> {
        self.tree.lock().await.children(path)
    }

    /// Number of nodes, not counting the root
    pub async fn node_count(&self) -> usize {
        self.tree.lock().await.nodes.len() - 1
    }
}

#[async_trait::async_trait]
impl Connector for MemoryEnsemble {
    async fn connect(&self, endpoints: &[String], session_timeout: Duration) -> Result<Arc<dyn Session>> {
        if endpoints.is_empty() {
            return Err(Error::Config("no coordination endpoints configured".into()));
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailed {
                address: endpoints.join(","),
                reason: "no endpoint reachable".into(),
            });
        }

        let mut tree = self.tree.lock().await;
        tree.next_session_id += 1;
        let id = SessionId(tree.next_session_id);

        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        state_tx.send_replace(SessionState::Connected);
        tree.sessions.insert(id, state_tx);

        tracing::debug!(
            func = "connect",
            session = %id,
            "session established (timeout {:?}) via {}",
            session_timeout,
            endpoints[0]
        );

        Ok(Arc::new(MemorySession {
            id,
            ensemble: self.clone(),
            state_rx,
        }))
    }
}

/// A session issued by a [`MemoryEnsemble`]
pub struct MemorySession {
    id: SessionId,
    ensemble: MemoryEnsemble,
    state_rx: watch::Receiver<SessionState>,
}

#[async_trait::async_trait]
impl Session for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    fn state_events(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn get_data(&self, path: &str) -> Result<Vec<u8>> {
        validate_path(path)?;
        let tree = self.ensemble.tree.lock().await;
        check_state(self.id, self.state())?;
        tree.nodes
            .get(path)
            .map(|node| node.data.clone())
            .ok_or_else(|| Error::NoNode(path.to_string()))
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let mut tree = self.ensemble.tree.lock().await;
        check_state(self.id, self.state())?;

        if tree.nodes.contains_key(path) {
            return Err(Error::NodeExists(path.to_string()));
        }

        let parent = parent_path(path).ok_or_else(|| Error::NodeExists(path.to_string()))?;
        match tree.nodes.get(parent) {
            None => return Err(Error::NoNode(parent.to_string())),
            Some(node) if node.ephemeral_owner.is_some() => {
                return Err(Error::NoChildrenForEphemerals(parent.to_string()));
            }
            Some(_) => {}
        }

        let ephemeral_owner = match mode {
            CreateMode::Ephemeral => Some(self.id),
            CreateMode::Persistent => None,
        };
        tree.nodes.insert(
            path.to_string(),
            ZNode {
                data: data.to_vec(),
                ephemeral_owner,
            },
        );
        tree.fire(path, EventKind::NodeCreated);

        Ok(path.to_string())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        if path == "/" {
            return Err(Error::InvalidPath(path.to_string()));
        }

        let mut tree = self.ensemble.tree.lock().await;
        check_state(self.id, self.state())?;

        if !tree.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        if tree.has_children(path) {
            return Err(Error::NotEmpty(path.to_string()));
        }

        tree.nodes.remove(path);
        tree.fire(path, EventKind::NodeDeleted);
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let tree = self.ensemble.tree.lock().await;
        check_state(self.id, self.state())?;

        if !tree.nodes.contains_key(path) {
            return Err(Error::NoNode(path.to_string()));
        }
        Ok(tree.children(path))
    }

    async fn exists_watch(&self, path: &str) -> Result<(bool, NodeWatcher)> {
        validate_path(path)?;
        let mut tree = self.ensemble.tree.lock().await;
        check_state(self.id, self.state())?;

        let exists = tree.nodes.contains_key(path);
        let (tx, watcher) = NodeWatcher::channel(path);
        tree.watches
            .entry(path.to_string())
            .or_default()
            .push(PendingWatch { session: self.id, tx });

        Ok((exists, watcher))
    }

    async fn close(&self) {
        let mut tree = self.ensemble.tree.lock().await;
        if tree.end_session(self.id, SessionState::Closed) {
            tracing::debug!(func = "close", session = %self.id, "session closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<String> {
        vec!["memory:2181".to_string()]
    }

    async fn session(ensemble: &MemoryEnsemble) -> Arc<dyn Session> {
        ensemble
            .connect(&endpoints(), Duration::from_secs(1))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_get_delete() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;

        assert!(matches!(s.get_data("/master").await, Err(Error::NoNode(_))));

        s.create("/master", b"n1", CreateMode::Ephemeral).await.unwrap();
        assert_eq!(s.get_data("/master").await.unwrap(), b"n1".to_vec());

        let err = s.create("/master", b"n2", CreateMode::Ephemeral).await.unwrap_err();
        assert!(matches!(err, Error::NodeExists(_)));

        s.delete("/master").await.unwrap();
        assert!(matches!(s.delete("/master").await, Err(Error::NoNode(_))));
    }

    #[tokio::test]
    async fn test_tree_rules() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;

        let err = s.create("/slaves/n1", b"n1", CreateMode::Ephemeral).await.unwrap_err();
        assert!(matches!(err, Error::NoNode(ref p) if p == "/slaves"));

        s.create("/slaves", b"", CreateMode::Persistent).await.unwrap();
        s.create("/slaves/n1", b"n1", CreateMode::Ephemeral).await.unwrap();
        s.create("/slaves/n2", b"n2", CreateMode::Ephemeral).await.unwrap();

        let err = s.create("/slaves/n1/x", b"", CreateMode::Persistent).await.unwrap_err();
        assert!(matches!(err, Error::NoChildrenForEphemerals(_)));

        assert!(matches!(s.delete("/slaves").await, Err(Error::NotEmpty(_))));
        assert!(matches!(s.get_data("bad").await, Err(Error::InvalidPath(_))));

        let mut children = s.children("/slaves").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["n1".to_string(), "n2".to_string()]);
        assert_eq!(s.children("/").await.unwrap(), vec!["slaves".to_string()]);
    }

    #[tokio::test]
    async fn test_ephemerals_reclaimed_on_close() {
        let ensemble = MemoryEnsemble::new();
        let s1 = session(&ensemble).await;
        let s2 = session(&ensemble).await;

        s1.create("/slaves", b"", CreateMode::Persistent).await.unwrap();
        s1.create("/master", b"n1", CreateMode::Ephemeral).await.unwrap();
        s2.create("/slaves/n2", b"n2", CreateMode::Ephemeral).await.unwrap();

        s1.close().await;
        assert_eq!(s1.state(), SessionState::Closed);
        assert!(matches!(s1.get_data("/slaves").await, Err(Error::SessionClosed(_))));

        assert!(matches!(s2.get_data("/master").await, Err(Error::NoNode(_))));
        assert!(s2.get_data("/slaves").await.is_ok());
        assert_eq!(ensemble.node_data("/slaves/n2").await.as_deref(), Some("n2"));
        assert_eq!(ensemble.node_count().await, 2);
    }

    #[tokio::test]
    async fn test_watch_fires_once_on_delete() {
        let ensemble = MemoryEnsemble::new();
        let owner = session(&ensemble).await;
        let observer = session(&ensemble).await;

        owner.create("/master", b"n1", CreateMode::Ephemeral).await.unwrap();
        let (exists, watcher) = observer.exists_watch("/master").await.unwrap();
        assert!(exists);

        ensemble.expire_session(owner.id()).await;

        let event = watcher.changed().await;
        assert_eq!(event.kind, EventKind::NodeDeleted);
        assert_eq!(event.path, "/master");

        // one-shot: a later create is not seen by the spent watcher
        observer.create("/master", b"n2", CreateMode::Ephemeral).await.unwrap();
        let (exists, watcher) = observer.exists_watch("/master").await.unwrap();
        assert!(exists);
        observer.delete("/master").await.unwrap();
        assert_eq!(watcher.changed().await.kind, EventKind::NodeDeleted);
    }

    #[tokio::test]
    async fn test_watch_fires_on_create() {
        let ensemble = MemoryEnsemble::new();
        let s1 = session(&ensemble).await;
        let s2 = session(&ensemble).await;

        let (exists, watcher) = s1.exists_watch("/master").await.unwrap();
        assert!(!exists);
        s2.create("/master", b"n2", CreateMode::Ephemeral).await.unwrap();
        assert_eq!(watcher.changed().await.kind, EventKind::NodeCreated);
    }

    #[tokio::test]
    async fn test_session_end_reaches_watchers() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;

        let (_, watcher) = s.exists_watch("/master").await.unwrap();
        ensemble.expire_session(s.id()).await;

        let event = watcher.changed().await;
        assert_eq!(event.kind, EventKind::Session);
        assert_eq!(event.state, SessionState::Expired);
        assert!(matches!(s.get_data("/").await, Err(Error::SessionExpired(_))));
    }

    #[tokio::test]
    async fn test_ended_sessions_leave_the_table() {
        let ensemble = MemoryEnsemble::new();
        let mut ended = Vec::new();
        for _ in 0..5 {
            let s = session(&ensemble).await;
            ensemble.expire_session(s.id()).await;
            ended.push(s);
        }
        let closed = session(&ensemble).await;
        closed.close().await;

        assert!(ensemble.session_ids().await.is_empty());
        assert_eq!(ensemble.tree.lock().await.sessions.len(), 0);
        assert_eq!(ensemble.session_state(closed.id()).await, None);

        // handles still report how their session ended
        assert_eq!(ended[0].state(), SessionState::Expired);
        assert_eq!(closed.state(), SessionState::Closed);
        assert!(!ensemble.expire_session(ended[0].id()).await);
        assert!(matches!(closed.get_data("/").await, Err(Error::SessionClosed(_))));
    }

    #[tokio::test]
    async fn test_dropped_connection_keeps_ephemerals() {
        let ensemble = MemoryEnsemble::new();
        let s = session(&ensemble).await;
        let mut events = s.state_events();

        s.create("/master", b"n1", CreateMode::Ephemeral).await.unwrap();
        assert!(ensemble.drop_connection(s.id()).await);
        events.changed().await.unwrap();
        assert_eq!(*events.borrow(), SessionState::Disconnected);

        assert!(matches!(s.get_data("/master").await, Err(Error::ConnectionLoss(_))));
        assert_eq!(ensemble.ephemeral_owner("/master").await, Some(s.id()));

        assert!(ensemble.restore_connection(s.id()).await);
        assert_eq!(s.get_data("/master").await.unwrap(), b"n1".to_vec());
    }

    #[tokio::test]
    async fn test_unreachable_ensemble() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_reachable(false);

        let err = ensemble.connect(&endpoints(), Duration::from_secs(1)).await.err().unwrap();
        assert!(err.is_retryable());

        ensemble.set_reachable(true);
        let s = session(&ensemble).await;
        assert_eq!(ensemble.session_ids().await, vec![s.id()]);
    }

    #[tokio::test]
    async fn test_concurrent_create_has_one_winner() {
        let ensemble = MemoryEnsemble::new();
        let mut handles = Vec::new();

        for i in 0..16 {
            let s = session(&ensemble).await;
            handles.push(tokio::spawn(async move {
                s.create("/master", format!("n{}", i).as_bytes(), CreateMode::Ephemeral)
                    .await
                    .is_ok()
            }));
        }

        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }
}
