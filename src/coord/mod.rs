//! Coordination Service Module
//!
//! Client-side view of a hierarchical, session-based coordination service
//! (ZooKeeper-style): a node tree with atomic create-if-absent, ephemeral
//! nodes bound to a session, and one-shot watches.
//!
//! Every failure the election logic branches on is a distinct
//! [`Error`] variant, so no caller ever inspects error text.

pub mod memory;
pub mod zookeeper;

pub use memory::MemoryEnsemble;
pub use zookeeper::ZooKeeperConnector;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

use crate::error::{Error, Result};

/// Service-assigned session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Connectivity state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress
    Connecting,
    /// Session established
    Connected,
    /// Session established and credentials accepted
    Authenticated,
    /// Connection dropped; the session may still recover
    Disconnected,
    /// The service expired the session and reclaimed its ephemeral nodes
    Expired,
    /// The service rejected the session's credentials
    AuthFailed,
    /// Closed by the client
    Closed,
}

impl SessionState {
    /// Requests can be issued in this state
    pub fn is_healthy(&self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Authenticated)
    }

    /// The session can never be used again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Expired | SessionState::AuthFailed | SessionState::Closed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "CONNECTING"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::Authenticated => write!(f, "AUTHENTICATED"),
            SessionState::Disconnected => write!(f, "DISCONNECTED"),
            SessionState::Expired => write!(f, "EXPIRED"),
            SessionState::AuthFailed => write!(f, "AUTH_FAILED"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Node lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
}

/// What a watch observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NodeCreated,
    NodeDeleted,
    /// The node's payload changed; it still exists
    NodeDataChanged,
    /// The owning session changed state; the watch is gone
    Session,
}

/// A fired watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub path: String,
    /// Session state at the time the event was delivered
    pub state: SessionState,
}

impl WatchEvent {
    /// Event for a change on a node
    pub fn node(kind: EventKind, path: &str) -> Self {
        Self {
            kind,
            path: path.to_string(),
            state: SessionState::Connected,
        }
    }

    /// Event telling the watcher its session went away
    pub fn session(path: &str, state: SessionState) -> Self {
        Self {
            kind: EventKind::Session,
            path: path.to_string(),
            state,
        }
    }
}

/// One-shot watch registration
///
/// Delivers exactly one event. Backends fire it by sending on the paired
/// [`oneshot::Sender`]; a dropped sender reads as the session being closed.
#[derive(Debug)]
pub struct NodeWatcher {
    path: String,
    rx: oneshot::Receiver<WatchEvent>,
}

impl NodeWatcher {
    /// Create a watcher and the sender that fires it
    pub fn channel(path: &str) -> (oneshot::Sender<WatchEvent>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { path: path.to_string(), rx })
    }

    /// Watched path
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the watch to fire
    pub async fn changed(self) -> WatchEvent {
        match self.rx.await {
            Ok(event) => event,
            Err(_) => WatchEvent::session(&self.path, SessionState::Closed),
        }
    }
}

/// Opens sessions against a coordination service
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Establish a new session against any of the endpoints
    async fn connect(&self, endpoints: &[String], session_timeout: Duration) -> Result<Arc<dyn Session>>;
}

/// A live session and the node operations issued through it
#[async_trait::async_trait]
pub trait Session: Send + Sync {
    /// Service-assigned identifier
    fn id(&self) -> SessionId;

    /// Current connectivity state
    fn state(&self) -> SessionState;

    /// Subscribe to connectivity state transitions
    fn state_events(&self) -> watch::Receiver<SessionState>;

    /// Read a node's payload; `Error::NoNode` if absent
    async fn get_data(&self, path: &str) -> Result<Vec<u8>>;

    /// Atomically create a node; `Error::NodeExists` if it is already there
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String>;

    /// Delete a node; `Error::NoNode` if absent
    async fn delete(&self, path: &str) -> Result<()>;

    /// Names of a node's direct children
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    /// Check existence and leave a one-shot watch for the next create/delete
    async fn exists_watch(&self, path: &str) -> Result<(bool, NodeWatcher)>;

    /// Close the session, releasing its ephemeral nodes and watches
    async fn close(&self);
}

/// Check a node path: absolute, no trailing slash, no empty segments
pub fn validate_path(path: &str) -> Result<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(Error::InvalidPath(path.to_string()));
    }
    if path[1..].split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..") {
        return Err(Error::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Parent of a node path (`None` for the root)
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a node path
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/master").is_ok());
        assert!(validate_path("/a/b/c").is_ok());
        assert!(validate_path("master").is_err());
        assert!(validate_path("/master/").is_err());
        assert!(validate_path("/a//b").is_err());
        assert!(validate_path("/a/../b").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_path("/master"), Some("/"));
        assert_eq!(parent_path("/slaves/n1"), Some("/slaves"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/slaves/n1"), "n1");
    }

    #[test]
    fn test_session_state_classes() {
        assert!(SessionState::Authenticated.is_healthy());
        assert!(!SessionState::Disconnected.is_healthy());
        assert!(!SessionState::Disconnected.is_terminal());
        assert!(SessionState::Expired.is_terminal());
        assert_eq!(SessionId(255).to_string(), "0xff");
    }

    #[tokio::test]
    async fn test_dropped_watcher_reads_as_closed() {
        let (tx, watcher) = NodeWatcher::channel("/master");
        drop(tx);
        let event = watcher.changed().await;
        assert_eq!(event.kind, EventKind::Session);
        assert_eq!(event.state, SessionState::Closed);
    }
}
