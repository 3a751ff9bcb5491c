//! Session supervision
//!
//! Owns the session lifecycle: connects, watches the session's state
//! transitions, and when a session is lost for good it suspends the
//! election, closes everything it held and reconnects on a fixed interval
//! until it succeeds or the manager is terminated. It is the only component
//! that ever replaces the session in the shared context.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{ElectionContext, ElectionCore, RoleOutcome, WatchLoop};
use crate::coord::{Session, SessionState};
use crate::error::{Error, Result};

/// Drives connection, loss detection and reconnection
pub struct SessionSupervisor {
    ctx: Arc<ElectionContext>,
}

impl SessionSupervisor {
    pub fn new(ctx: Arc<ElectionContext>) -> Self {
        Self { ctx }
    }

    /// Open a session and install it as the current one
    ///
    /// Bounded by the configured session timeout.
    pub async fn connect(&self) -> Result<Arc<dyn Session>> {
        let config = self.ctx.config();
        let endpoints = &config.coordinator.endpoints;
        let timeout = config.session_timeout();

        let session = match tokio::time::timeout(
            timeout,
            self.ctx.connector().connect(endpoints, timeout),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(Error::ConnectionTimeout(endpoints.join(","))),
        };

        let mut events = session.state_events();
        if let Err(state) = await_healthy(&mut events, timeout).await {
            session.close().await;
            return Err(match state {
                SessionState::AuthFailed => Error::AuthFailed(session.id().to_string()),
                SessionState::Expired => Error::SessionExpired(session.id().to_string()),
                _ => Error::ConnectionTimeout(endpoints.join(",")),
            });
        }

        tracing::info!(
            func = "connect",
            session = %session.id(),
            "connected to coordination service ({})",
            endpoints.join(",")
        );
        self.ctx.install_session(session.clone()).await;
        Ok(session)
    }

    /// Supervise sessions until terminated
    ///
    /// `session` is the one `start` connected; `election_ok` tells the first
    /// watch loop whether the initial election went through.
    pub async fn run(self, mut session: Arc<dyn Session>, mut election_ok: bool) {
        let mut shutdown = self.ctx.subscribe_shutdown();

        loop {
            let (stop_tx, stop_rx) = watch::channel(false);
            let watcher = WatchLoop::new(self.ctx.clone(), session.id());
            let watch_task = tokio::spawn(watcher.run(stop_rx, election_ok));

            let lost = self.wait_for_loss(session.as_ref(), &mut shutdown).await;

            let _ = stop_tx.send(true);
            if let Err(e) = watch_task.await {
                tracing::error!(func = "run", "watch loop task failed: {}", e);
            }

            let state = match lost {
                Some(state) if !self.ctx.shutdown_requested() => state,
                _ => break,
            };

            self.suspend(session.as_ref(), state).await;

            session = match self.reconnect(&mut shutdown).await {
                Some(session) => session,
                None => break,
            };

            election_ok = match ElectionCore::new(self.ctx.clone()).elect_for_master().await {
                Ok(outcome) => {
                    tracing::info!(func = "run", "re-elected after reconnect as {}", outcome);
                    true
                }
                Err(e) => {
                    tracing::error!(func = "run", "error electing this node for master after reconnect: {}", e);
                    false
                }
            };
        }

        tracing::info!(func = "run", "session supervisor stopped");
    }

    /// Wait until the session is gone for good; `None` means teardown was requested
    async fn wait_for_loss(
        &self,
        session: &dyn Session,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Option<SessionState> {
        let mut events = session.state_events();
        let recovery_window = self.ctx.config().session_timeout();

        loop {
            if *shutdown.borrow() {
                return None;
            }

            let state = *events.borrow_and_update();
            if state.is_terminal() {
                return Some(state);
            }

            if state == SessionState::Disconnected {
                tracing::warn!(
                    func = "wait_for_loss",
                    session = %session.id(),
                    "connection lost, waiting up to {:?} for it to recover",
                    recovery_window
                );

                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return None,
                    recovered = await_healthy(&mut events, recovery_window) => match recovered {
                        Ok(()) => {
                            tracing::info!(func = "wait_for_loss", session = %session.id(), "connection recovered");
                            continue;
                        }
                        Err(state) => return Some(state),
                    }
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => return None,
                changed = events.changed() => {
                    if changed.is_err() {
                        return Some(SessionState::Closed);
                    }
                }
            }
        }
    }

    /// Give up the lost session: report Disconnected, then release it
    async fn suspend(&self, session: &dyn Session, state: SessionState) {
        tracing::warn!(
            func = "suspend",
            session = %session.id(),
            "session lost ({}), suspending election",
            state
        );

        self.ctx.transition(RoleOutcome::Disconnected).await;
        self.ctx.release_session(session.id()).await;
        session.close().await;
    }

    /// Reconnect on a fixed interval; `None` if terminated first
    async fn reconnect(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Arc<dyn Session>> {
        let interval = self.ctx.config().reconnect_interval();
        let mut attempt: u64 = 0;

        loop {
            if *shutdown.borrow() {
                return None;
            }

            tokio::select! {
                biased;
                _ = shutdown.changed() => return None,
                _ = tokio::time::sleep(interval) => {}
            }

            attempt += 1;
            match self.connect().await {
                Ok(session) => {
                    if self.ctx.shutdown_requested() {
                        self.ctx.release_session(session.id()).await;
                        session.close().await;
                        return None;
                    }
                    tracing::info!(
                        func = "reconnect",
                        attempt,
                        session = %session.id(),
                        "reconnected to coordination service"
                    );
                    return Some(session);
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        func = "reconnect",
                        attempt,
                        "reconnection failed: {}; retrying in {:?}",
                        e,
                        interval
                    );
                }
                Err(e) => {
                    tracing::error!(
                        func = "reconnect",
                        attempt,
                        "reconnection rejected: {}; retrying in {:?}",
                        e,
                        interval
                    );
                }
            }
        }
    }
}

/// Wait for a healthy state within `limit`
///
/// Fails with the terminal state reached, or `Disconnected` when the limit
/// runs out first.
async fn await_healthy(
    events: &mut watch::Receiver<SessionState>,
    limit: Duration,
) -> std::result::Result<(), SessionState> {
    let wait = async {
        loop {
            let state = *events.borrow_and_update();
            if state.is_healthy() {
                return Ok(());
            }
            if state.is_terminal() {
                return Err(state);
            }
            if events.changed().await.is_err() {
                return Err(SessionState::Closed);
            }
        }
    };

    match tokio::time::timeout(limit, wait).await {
        Ok(result) => result,
        Err(_) => Err(SessionState::Disconnected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::MemoryEnsemble;
    use crate::election::test_support::{context, next_outcome};
    use crate::election::Role;

    #[tokio::test]
    async fn test_connect_installs_session() {
        let ensemble = MemoryEnsemble::new();
        let (ctx, _rx) = context(&ensemble, "n1");

        let session = SessionSupervisor::new(ctx.clone()).connect().await.unwrap();
        assert_eq!(ctx.current_session_id().await, Some(session.id()));
        assert!(session.state().is_healthy());
    }

    #[tokio::test]
    async fn test_connect_fails_when_unreachable() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_reachable(false);
        let (ctx, _rx) = context(&ensemble, "n1");

        let err = SessionSupervisor::new(ctx.clone()).connect().await.err().unwrap();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert_eq!(ctx.current_session_id().await, None);
    }

    #[tokio::test]
    async fn test_await_healthy_times_out_while_disconnected() {
        let (_tx, mut rx) = watch::channel(SessionState::Disconnected);
        let result = await_healthy(&mut rx, Duration::from_millis(20)).await;
        assert_eq!(result, Err(SessionState::Disconnected));
    }

    #[tokio::test]
    async fn test_await_healthy_reports_terminal_state() {
        let (tx, mut rx) = watch::channel(SessionState::Disconnected);
        tx.send_replace(SessionState::Expired);
        let result = await_healthy(&mut rx, Duration::from_secs(1)).await;
        assert_eq!(result, Err(SessionState::Expired));
    }

    #[tokio::test]
    async fn test_expired_session_is_replaced() {
        let ensemble = MemoryEnsemble::new();
        let (ctx, mut rx) = context(&ensemble, "n1");
        let supervisor = SessionSupervisor::new(ctx.clone());

        let session = supervisor.connect().await.unwrap();
        let first = session.id();
        ElectionCore::new(ctx.clone()).elect_for_master().await.unwrap();
        assert_eq!(next_outcome(&mut rx).await, RoleOutcome::Master);

        let task = tokio::spawn(supervisor.run(session, true));
        ensemble.expire_session(first).await;

        assert_eq!(next_outcome(&mut rx).await, RoleOutcome::Disconnected);
        assert_eq!(next_outcome(&mut rx).await, RoleOutcome::Master);

        let second = ctx.current_session_id().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(ensemble.ephemeral_owner("/master").await, Some(second));
        assert_eq!(ctx.role().await, Role::Master);

        ctx.request_shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_retries_until_reachable() {
        let ensemble = MemoryEnsemble::new();
        let (ctx, mut rx) = context(&ensemble, "n1");
        let supervisor = SessionSupervisor::new(ctx.clone());

        let session = supervisor.connect().await.unwrap();
        ElectionCore::new(ctx.clone()).elect_for_master().await.unwrap();
        assert_eq!(next_outcome(&mut rx).await, RoleOutcome::Master);

        let id = session.id();
        let task = tokio::spawn(supervisor.run(session, true));

        ensemble.set_reachable(false);
        ensemble.expire_session(id).await;
        assert_eq!(next_outcome(&mut rx).await, RoleOutcome::Disconnected);

        // several reconnect intervals pass without a session
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctx.current_session_id().await, None);
        assert_eq!(ctx.role().await, Role::Disconnected);

        ensemble.set_reachable(true);
        assert_eq!(next_outcome(&mut rx).await, RoleOutcome::Master);

        ctx.request_shutdown();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_reconnect_sleep() {
        let ensemble = MemoryEnsemble::new();
        let (base, _) = context(&ensemble, "n1");
        let mut config = base.config().clone();
        config.coordinator.reconnect_interval_ms = 60_000;
        let (ctx, mut rx) = ElectionContext::new(config, "n1".into(), Arc::new(ensemble.clone()));
        let ctx = Arc::new(ctx);
        let supervisor = SessionSupervisor::new(ctx.clone());

        let session = supervisor.connect().await.unwrap();
        let id = session.id();
        let task = tokio::spawn(supervisor.run(session, true));

        ensemble.expire_session(id).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.request_shutdown();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("supervisor did not stop")
            .unwrap();
        assert_eq!(rx.try_recv().ok(), Some(RoleOutcome::Disconnected));
        assert!(rx.try_recv().is_err());
        assert_eq!(ctx.current_session_id().await, None);
    }
}
