//! Election manager
//!
//! Composition root wiring the supervisor, election core, watch loop and
//! cluster view around one shared context. This is the surface the owning
//! process uses: start, terminate, query the role, read the cluster, and
//! consume role outcomes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::{
    ClusterSnapshot, ClusterView, ElectionContext, ElectionCore, Role, RoleOutcome,
    SessionSupervisor,
};
use crate::config::ShepherdConfig;
use crate::coord::{Connector, SessionId};
use crate::error::{Error, Result};
use crate::identity::resolve_identity;

/// Master/slave election for one process in one election group
pub struct ElectionManager {
    /// Shared state
    ctx: Arc<ElectionContext>,
    /// Outcome receiver, handed out once
    outcomes: Mutex<Option<mpsc::UnboundedReceiver<RoleOutcome>>>,
    /// Background supervisor task
    supervisor: Mutex<Option<JoinHandle<()>>>,
    /// Set once `start` has been called
    started: AtomicBool,
}

impl ElectionManager {
    /// Create a manager; validates the configuration and resolves identity
    pub fn new(config: ShepherdConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let identity = resolve_identity(config.election.identity.as_deref())?;

        let (ctx, outcome_rx) = ElectionContext::new(config, identity, connector);

        Ok(Self {
            ctx: Arc::new(ctx),
            outcomes: Mutex::new(Some(outcome_rx)),
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    /// This process's identity
    pub fn identity(&self) -> &str {
        self.ctx.identity()
    }

    /// Take the role outcome receiver (only the first call gets it)
    pub async fn take_outcomes(&self) -> Option<mpsc::UnboundedReceiver<RoleOutcome>> {
        self.outcomes.lock().await.take()
    }

    /// Connect, run the first election and start the background loops
    ///
    /// A failed connect or first election is returned; the session is
    /// released and `start` may be called again.
    pub async fn start(&self) -> Result<()> {
        if self.ctx.shutdown_requested() {
            return Err(Error::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyStarted);
        }

        let supervisor = SessionSupervisor::new(self.ctx.clone());
        let session = match supervisor.connect().await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(func = "start", "error connecting to coordination service: {}", e);
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        match ElectionCore::new(self.ctx.clone()).elect_for_master().await {
            Ok(outcome) => {
                tracing::info!(func = "start", identity = %self.identity(), "started as {}", outcome);
            }
            Err(e) => {
                tracing::error!(func = "start", "error electing this node for master: {}", e);
                if let Some(session) = self.ctx.take_session().await {
                    session.close().await;
                }
                self.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        let handle = tokio::spawn(supervisor.run(session, true));
        *self.supervisor.lock().await = Some(handle);

        Ok(())
    }

    /// Release the session and stop the background loops
    ///
    /// Idempotent. Waits the configured grace period afterwards so the
    /// service can reclaim this process's ephemeral nodes.
    pub async fn terminate(&self) {
        if !self.ctx.request_shutdown() {
            return;
        }

        if let Ok(session) = self.ctx.current_session().await {
            session.close().await;
        }

        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(func = "terminate", "session supervisor task failed: {}", e);
            }
        }

        if let Some(session) = self.ctx.take_session().await {
            session.close().await;
        }

        if matches!(self.ctx.role().await, Role::Master | Role::Slave) {
            self.ctx.transition(RoleOutcome::Disconnected).await;
        }

        tracing::info!(func = "terminate", "coordination session closed");

        if self.started.load(Ordering::SeqCst) {
            tokio::time::sleep(self.ctx.config().terminate_grace()).await;
        }
    }

    /// Alias of [`terminate`](Self::terminate)
    pub async fn close(&self) {
        self.terminate().await
    }

    /// Last known role is master (no network call)
    pub async fn is_master(&self) -> bool {
        self.ctx.role().await == Role::Master
    }

    /// Last known role
    pub async fn role(&self) -> Role {
        self.ctx.role().await
    }

    /// Current session, if connected
    pub async fn session_id(&self) -> Option<SessionId> {
        self.ctx.current_session_id().await
    }

    /// Read the cluster membership from the coordination service
    pub async fn get_cluster_info(&self) -> Result<ClusterSnapshot> {
        ClusterView::new(self.ctx.clone()).get_cluster_info().await
    }
}
