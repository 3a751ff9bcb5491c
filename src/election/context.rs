//! Shared election state
//!
//! One `ElectionContext` exists per election group member. It owns the
//! current session slot, the last known role and the outcome channel, and
//! carries the teardown signal every background loop observes. Components
//! fetch the session from here on every operation instead of keeping their
//! own copy, so a reconnect is picked up everywhere at once.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

use super::{Role, RoleOutcome};
use crate::config::ShepherdConfig;
use crate::coord::{Connector, Session, SessionId};
use crate::error::{Error, Result};

/// State shared by the supervisor, election core, watch loop and cluster view
pub struct ElectionContext {
    /// Validated configuration
    config: ShepherdConfig,
    /// This process's identity (election payload and slave node name)
    identity: String,
    /// Opens new sessions
    connector: Arc<dyn Connector>,
    /// Current session; replaced only by the session supervisor
    session: RwLock<Option<Arc<dyn Session>>>,
    /// Last known role
    role: RwLock<Role>,
    /// Role transitions for the owning process
    outcome_tx: mpsc::UnboundedSender<RoleOutcome>,
    /// Teardown signal
    shutdown: watch::Sender<bool>,
}

impl ElectionContext {
    /// Create a context and the receiving end of its outcome channel
    pub fn new(
        config: ShepherdConfig,
        identity: String,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<RoleOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let ctx = Self {
            config,
            identity,
            connector,
            session: RwLock::new(None),
            role: RwLock::new(Role::Unknown),
            outcome_tx,
            shutdown,
        };
        (ctx, outcome_rx)
    }

    pub fn config(&self) -> &ShepherdConfig {
        &self.config
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// The session to issue requests on right now
    pub async fn current_session(&self) -> Result<Arc<dyn Session>> {
        self.session.read().await.clone().ok_or(Error::NotConnected)
    }

    /// Identifier of the current session, if connected
    pub async fn current_session_id(&self) -> Option<SessionId> {
        self.session.read().await.as_ref().map(|s| s.id())
    }

    pub(super) async fn install_session(&self, session: Arc<dyn Session>) {
        *self.session.write().await = Some(session);
    }

    /// Clear the slot if it still holds the given session
    pub(super) async fn release_session(&self, id: SessionId) {
        let mut slot = self.session.write().await;
        if slot.as_ref().map(|s| s.id()) == Some(id) {
            *slot = None;
        }
    }

    pub(super) async fn take_session(&self) -> Option<Arc<dyn Session>> {
        self.session.write().await.take()
    }

    /// Last known role
    pub async fn role(&self) -> Role {
        *self.role.read().await
    }

    /// Record a role and publish it if it differs from the previous one
    ///
    /// Publishing happens under the role lock, so outcomes reach the owning
    /// process in the order they were decided.
    pub async fn transition(&self, outcome: RoleOutcome) -> bool {
        let mut role = self.role.write().await;
        let next = Role::from(outcome);
        if *role == next {
            return false;
        }

        tracing::info!(
            func = "transition",
            identity = %self.identity,
            "role changed: {} -> {}",
            *role,
            next
        );
        *role = next;

        if self.outcome_tx.send(outcome).is_err() {
            tracing::debug!(func = "transition", "outcome receiver dropped, {} not delivered", outcome);
        }
        true
    }

    /// Subscribe to the teardown signal
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Raise the teardown signal; returns false if it was already raised
    pub(super) fn request_shutdown(&self) -> bool {
        !self.shutdown.send_replace(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryEnsemble;
    use crate::election::test_support::context;

    #[tokio::test]
    async fn test_transition_publishes_only_changes() {
        let ensemble = MemoryEnsemble::new();
        let (ctx, mut rx) = context(&ensemble, "n1");

        assert_eq!(ctx.role().await, Role::Unknown);
        assert!(ctx.transition(RoleOutcome::Slave).await);
        assert!(!ctx.transition(RoleOutcome::Slave).await);
        assert!(ctx.transition(RoleOutcome::Master).await);

        assert_eq!(rx.recv().await, Some(RoleOutcome::Slave));
        assert_eq!(rx.recv().await, Some(RoleOutcome::Master));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_session_slot() {
        let ensemble = MemoryEnsemble::new();
        let (ctx, _rx) = context(&ensemble, "n1");

        assert!(matches!(ctx.current_session().await, Err(Error::NotConnected)));

        let session = ensemble
            .connect(&ctx.config().coordinator.endpoints, ctx.config().session_timeout())
            .await
            .unwrap();
        let id = session.id();
        ctx.install_session(session).await;
        assert_eq!(ctx.current_session_id().await, Some(id));

        ctx.release_session(SessionId(id.0 + 1)).await;
        assert_eq!(ctx.current_session_id().await, Some(id));
        ctx.release_session(id).await;
        assert_eq!(ctx.current_session_id().await, None);
    }

    #[test]
    fn test_shutdown_raised_once() {
        let ensemble = MemoryEnsemble::new();
        let (ctx, _rx) = context(&ensemble, "n1");
        assert!(!ctx.shutdown_requested());
        assert!(ctx.request_shutdown());
        assert!(!ctx.request_shutdown());
        assert!(ctx.shutdown_requested());
    }
}
