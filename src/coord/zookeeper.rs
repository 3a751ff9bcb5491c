//! ZooKeeper backend
//!
//! [`Connector`] and [`Session`] over a real ZooKeeper ensemble. Client
//! errors, session states and watch events are translated into the crate's
//! own types at this boundary; nothing above it sees the client library.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use zookeeper_client as zk;

use super::{
    validate_path, Connector, CreateMode, EventKind, NodeWatcher, Session, SessionId,
    SessionState, WatchEvent,
};
use crate::error::{Error, Result};

/// Opens sessions against a ZooKeeper ensemble
///
/// Session ids are handles assigned by this connector, unique within the
/// process.
#[derive(Debug, Default)]
pub struct ZooKeeperConnector {
    next_handle: AtomicU64,
}

impl ZooKeeperConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Connector for ZooKeeperConnector {
    async fn connect(&self, endpoints: &[String], session_timeout: Duration) -> Result<Arc<dyn Session>> {
        if endpoints.is_empty() {
            return Err(Error::Config("no coordination endpoints configured".into()));
        }
        let cluster = endpoints.join(",");

        let client = zk::Client::connector()
            .session_timeout(session_timeout)
            .connect(&cluster)
            .await
            .map_err(|e| Error::ConnectionFailed {
                address: cluster.clone(),
                reason: e.to_string(),
            })?;

        let id = SessionId(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        let (state_tx, state_rx) = watch::channel(map_state(client.state()));
        let state_tx = Arc::new(state_tx);
        let mut states = client.state_watcher();

        let forward_tx = state_tx.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let state = map_state(states.changed().await);
                forward_tx.send_replace(state);
                if state.is_terminal() {
                    break;
                }
            }
        });

        tracing::info!(
            func = "connect",
            session = %id,
            "zookeeper session established (timeout {:?}) via {}",
            session_timeout,
            cluster
        );

        Ok(Arc::new(ZooKeeperSession {
            id,
            client: Mutex::new(Some(client)),
            state_tx,
            state_rx,
            forwarder,
        }))
    }
}

/// A session on a ZooKeeper ensemble
pub struct ZooKeeperSession {
    id: SessionId,
    /// Dropping the last client handle closes the server-side session
    client: Mutex<Option<zk::Client>>,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    forwarder: JoinHandle<()>,
}

impl ZooKeeperSession {
    async fn client(&self) -> Result<zk::Client> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::SessionClosed(self.id.to_string()))
    }
}

impl Drop for ZooKeeperSession {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[async_trait::async_trait]
impl Session for ZooKeeperSession {
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
        let client = self.client().await?;
        let (data, _stat) = client
            .get_data(path)
            .await
            .map_err(|e| map_error(e, path, self.id))?;
        Ok(data)
    }

    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        validate_path(path)?;
        let client = self.client().await?;
        let options = match mode {
            CreateMode::Persistent => zk::CreateMode::Persistent,
            CreateMode::Ephemeral => zk::CreateMode::Ephemeral,
        }
        .with_acls(zk::Acls::anyone_all());

        client
            .create(path, data, &options)
            .await
            .map_err(|e| map_error(e, path, self.id))?;
        Ok(path.to_string())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        let client = self.client().await?;
        client
            .delete(path, None)
            .await
            .map_err(|e| map_error(e, path, self.id))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let client = self.client().await?;
        client
            .list_children(path)
            .await
            .map_err(|e| map_error(e, path, self.id))
    }

    async fn exists_watch(&self, path: &str) -> Result<(bool, NodeWatcher)> {
        validate_path(path)?;
        let client = self.client().await?;
        let (stat, zk_watcher) = client
            .check_and_watch_stat(path)
            .await
            .map_err(|e| map_error(e, path, self.id))?;

        let (mut tx, watcher) = NodeWatcher::channel(path);
        let watched = path.to_string();
        tokio::spawn(async move {
            let event = tokio::select! {
                event = zk_watcher.changed() => event,
                _ = tx.closed() => return,
            };
            let _ = tx.send(map_event(&watched, event.event_type, event.session_state));
        });

        Ok((stat.is_some(), watcher))
    }

    async fn close(&self) {
        if self.client.lock().await.take().is_some() {
            self.forwarder.abort();
            if !self.state_rx.borrow().is_terminal() {
                self.state_tx.send_replace(SessionState::Closed);
            }
            tracing::debug!(func = "close", session = %self.id, "zookeeper session closed");
        }
    }
}

fn map_state(state: zk::SessionState) -> SessionState {
    match state {
        zk::SessionState::SyncConnected => SessionState::Connected,
        zk::SessionState::Disconnected => SessionState::Disconnected,
        zk::SessionState::Expired => SessionState::Expired,
        zk::SessionState::AuthFailed => SessionState::AuthFailed,
        zk::SessionState::Closed => SessionState::Closed,
        _ => SessionState::Connecting,
    }
}

fn map_event(path: &str, kind: zk::EventType, state: zk::SessionState) -> WatchEvent {
    match kind {
        zk::EventType::NodeCreated => WatchEvent::node(EventKind::NodeCreated, path),
        zk::EventType::NodeDeleted => WatchEvent::node(EventKind::NodeDeleted, path),
        zk::EventType::Session => WatchEvent::session(path, map_state(state)),
        _ => WatchEvent::node(EventKind::NodeDataChanged, path),
    }
}

fn map_error(err: zk::Error, path: &str, id: SessionId) -> Error {
    match err {
        zk::Error::NoNode => Error::NoNode(path.to_string()),
        zk::Error::NodeExists => Error::NodeExists(path.to_string()),
        zk::Error::NotEmpty => Error::NotEmpty(path.to_string()),
        zk::Error::NoChildrenForEphemerals => Error::NoChildrenForEphemerals(path.to_string()),
        zk::Error::BadArguments(reason) => Error::InvalidPath(format!("{} ({})", path, reason)),
        zk::Error::ConnectionLoss => Error::ConnectionLoss(id.to_string()),
        zk::Error::SessionExpired => Error::SessionExpired(id.to_string()),
        zk::Error::AuthFailed => Error::AuthFailed(id.to_string()),
        zk::Error::ClientClosed => Error::SessionClosed(id.to_string()),
        other => Error::Internal(format!("zookeeper request on {} failed: {}", path, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::test_support::test_config;
    use crate::election::{ElectionManager, Role};

    #[test]
    fn test_error_translation() {
        let id = SessionId(7);
        assert!(matches!(map_error(zk::Error::NoNode, "/master", id), Error::NoNode(p) if p == "/master"));
        assert!(matches!(map_error(zk::Error::NodeExists, "/master", id), Error::NodeExists(_)));
        assert!(matches!(map_error(zk::Error::NotEmpty, "/slaves", id), Error::NotEmpty(_)));
        assert!(matches!(
            map_error(zk::Error::NoChildrenForEphemerals, "/a/b", id),
            Error::NoChildrenForEphemerals(_)
        ));

        let loss = map_error(zk::Error::ConnectionLoss, "/master", id);
        assert!(loss.is_retryable());
        assert!(!loss.is_session_fatal());

        for fatal in [zk::Error::SessionExpired, zk::Error::AuthFailed, zk::Error::ClientClosed] {
            assert!(map_error(fatal, "/master", id).is_session_fatal());
        }
    }

    #[test]
    fn test_state_translation() {
        assert_eq!(map_state(zk::SessionState::SyncConnected), SessionState::Connected);
        assert_eq!(map_state(zk::SessionState::Disconnected), SessionState::Disconnected);
        assert!(map_state(zk::SessionState::Expired).is_terminal());
        assert!(map_state(zk::SessionState::AuthFailed).is_terminal());
        assert!(map_state(zk::SessionState::Closed).is_terminal());
    }

    #[test]
    fn test_event_translation() {
        let deleted = map_event("/master", zk::EventType::NodeDeleted, zk::SessionState::SyncConnected);
        assert_eq!(deleted.kind, EventKind::NodeDeleted);
        assert_eq!(deleted.path, "/master");

        let created = map_event("/master", zk::EventType::NodeCreated, zk::SessionState::SyncConnected);
        assert_eq!(created.kind, EventKind::NodeCreated);

        let changed = map_event("/master", zk::EventType::NodeDataChanged, zk::SessionState::SyncConnected);
        assert_eq!(changed.kind, EventKind::NodeDataChanged);

        let expired = map_event("/master", zk::EventType::Session, zk::SessionState::Expired);
        assert_eq!(expired.kind, EventKind::Session);
        assert_eq!(expired.state, SessionState::Expired);
    }

    #[tokio::test]
    async fn test_start_dials_configured_endpoints() {
        let mut config = test_config("n1");
        config.coordinator.endpoints = vec!["zk.does-not-exist.invalid:2181".to_string()];
        let manager = ElectionManager::new(config, Arc::new(ZooKeeperConnector::new())).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), manager.start())
            .await
            .expect("start did not respect the session timeout");

        assert!(matches!(
            result,
            Err(Error::ConnectionFailed { .. }) | Err(Error::ConnectionTimeout(_))
        ));
        assert_eq!(manager.role().await, Role::Unknown);
        assert!(!manager.is_master().await);
        assert_eq!(manager.session_id().await, None);
    }

    #[tokio::test]
    async fn test_connect_requires_endpoints() {
        let err = ZooKeeperConnector::new()
            .connect(&[], Duration::from_millis(100))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }
}
