//! Election node watch
//!
//! Keeps exactly one watch armed on the election node for the lifetime of a
//! session. Watches fire at most once, so the loop re-arms after every
//! event; a deletion means the master is gone and triggers a new claim.

use std::sync::Arc;
use tokio::sync::watch;

use super::{ElectionContext, ElectionCore};
use crate::coord::{EventKind, SessionId};

/// Watch-and-react loop bound to one session
pub struct WatchLoop {
    ctx: Arc<ElectionContext>,
    session_id: SessionId,
}

impl WatchLoop {
    pub fn new(ctx: Arc<ElectionContext>, session_id: SessionId) -> Self {
        Self { ctx, session_id }
    }

    /// Run until the session ends or `stop` is raised
    ///
    /// `claim_if_absent` allows one claim when the election node is found
    /// missing while arming, which covers a deletion that happened before
    /// the watch was in place. A failed claim withholds that retry until the
    /// next watch event, so a persistent failure never spins.
    pub async fn run(self, mut stop: watch::Receiver<bool>, mut claim_if_absent: bool) {
        let path = self.ctx.config().election.election_node.clone();
        let retry_interval = self.ctx.config().reconnect_interval();

        loop {
            if *stop.borrow() {
                break;
            }

            let session = match self.ctx.current_session().await {
                Ok(session) if session.id() == self.session_id => session,
                _ => {
                    tracing::debug!(func = "watch", "session {} replaced, watch loop exiting", self.session_id);
                    break;
                }
            };

            let armed = session.exists_watch(&path).await;
            drop(session);

            let (exists, watcher) = match armed {
                Ok(armed) => armed,
                Err(e) if e.is_session_fatal() => {
                    tracing::debug!(func = "watch", "session gone while arming watch: {}", e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(func = "watch", "error listening for election node events: {}", e);
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(retry_interval) => continue,
                    }
                }
            };

            tracing::debug!(func = "watch", "watch armed on {} (exists: {})", path, exists);

            if !exists && claim_if_absent {
                tracing::info!(func = "watch", "no master elected, trying to be the master...");
                claim_if_absent = self.elect().await;
            }

            tokio::select! {
                event = watcher.changed() => match event.kind {
                    EventKind::NodeDeleted => {
                        tracing::info!(func = "watch", "master has quit, trying to be the new master...");
                        claim_if_absent = self.elect().await;
                    }
                    EventKind::NodeCreated => {
                        tracing::info!(func = "watch", "a new master has been elected...");
                        claim_if_absent = true;
                    }
                    EventKind::NodeDataChanged => {
                        tracing::debug!(func = "watch", "election node payload changed, re-arming");
                    }
                    EventKind::Session if event.state.is_terminal() => {
                        tracing::debug!(func = "watch", "session ended ({}), watch loop exiting", event.state);
                        break;
                    }
                    EventKind::Session => {
                        tracing::debug!(func = "watch", "session event ({}), re-arming", event.state);
                    }
                },
                _ = stop.changed() => break,
            }
        }
    }

    async fn elect(&self) -> bool {
        match ElectionCore::new(self.ctx.clone()).elect_for_master().await {
            Ok(outcome) => {
                tracing::debug!(func = "watch", "election finished as {}", outcome);
                true
            }
            Err(e) => {
                tracing::error!(func = "watch", "error trying to elect this node for master: {}", e);
                false
            }
        }
    }
}
