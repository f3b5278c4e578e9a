//! Session manager: the surface used by connection handlers and monitoring.

use std::sync::Arc;

use room_sessions_core::{
    Clock, LivenessPolicy, Session, SessionId, SessionStore, SystemClock,
    traits::{ActiveSessionView, REASON_FORCED_CLEANUP, TerminalStatus, TerminateOutcome},
};

use crate::{
    creator::{RetryPolicy, SessionCreator},
    error::SessionError,
    health::HealthMonitor,
    reaper::GhostReaper,
};

/// Session manager for room sessions.
///
/// Owns one store handle shared by the creator, the health monitor and the
/// ghost reaper.
pub struct SessionManager<S>
where
    S: SessionStore,
{
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: LivenessPolicy,
    creator: SessionCreator<S>,
    monitor: HealthMonitor<S>,
    reaper: GhostReaper<S>,
}

impl<S> SessionManager<S>
where
    S: SessionStore,
{
    /// Create a session manager using wall-clock time and default retries.
    #[must_use]
    pub fn new(store: S, policy: LivenessPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock), RetryPolicy::default())
    }

    /// Create a session manager with an explicit clock and retry policy.
    #[must_use]
    pub fn with_clock(
        store: S,
        policy: LivenessPolicy,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Self {
        let store = Arc::new(store);
        Self {
            creator: SessionCreator::new(Arc::clone(&store), Arc::clone(&clock), policy, retry),
            monitor: HealthMonitor::new(Arc::clone(&store), Arc::clone(&clock), policy),
            reaper: GhostReaper::new(Arc::clone(&store), Arc::clone(&clock), policy),
            store,
            clock,
            policy,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> &LivenessPolicy {
        &self.policy
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub const fn health(&self) -> &HealthMonitor<S> {
        &self.monitor
    }

    #[must_use]
    pub const fn reaper(&self) -> &GhostReaper<S> {
        &self.reaper
    }

    /// Get or create the room's active session.
    ///
    /// # Errors
    /// Returns error if the store stays unavailable through the retry budget,
    /// or if the room is found with more than one active session.
    pub async fn ensure_active_session(
        &self,
        room_id: &str,
        tenant_id: &str,
    ) -> Result<SessionId, SessionError> {
        let outcome = self
            .creator
            .ensure_active_session(room_id, tenant_id)
            .await?;
        for ghost in &outcome.reclaimed {
            self.monitor.forget(*ghost).await;
        }
        if outcome.created {
            self.monitor
                .track(outcome.session_id, self.clock.now())
                .await;
        }
        Ok(outcome.session_id)
    }

    /// Write a heartbeat. See [`HealthMonitor::monitor_heartbeat`].
    pub async fn monitor_heartbeat(&self, session_id: SessionId) -> bool {
        self.monitor.monitor_heartbeat(session_id).await
    }

    /// See [`HealthMonitor::should_force_cleanup`].
    pub async fn should_force_cleanup(&self, session_id: SessionId) -> bool {
        self.monitor.should_force_cleanup(session_id).await
    }

    /// See [`HealthMonitor::increment_recovery_attempt`].
    pub async fn increment_recovery_attempt(&self, session_id: SessionId) -> u32 {
        self.monitor.increment_recovery_attempt(session_id).await
    }

    /// Close a session gracefully. Closing a terminal session is a no-op.
    ///
    /// # Errors
    /// Returns error if the session does not exist or the store fails.
    pub async fn close_session(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Result<TerminateOutcome, SessionError> {
        let result = self
            .store
            .terminate(session_id, TerminalStatus::Closed, reason, self.clock.now())
            .await;
        self.monitor.forget(session_id).await;
        let outcome = result?;

        match outcome {
            TerminateOutcome::Terminated => {
                tracing::info!(session_id = %session_id, reason, "Session closed");
            }
            TerminateOutcome::AlreadyTerminal(status) => {
                tracing::debug!(session_id = %session_id, %status, "Session already terminal");
            }
        }
        Ok(outcome)
    }

    /// Give up on a session whose heartbeats keep failing: mark it ghost so
    /// the room's slot is free for the next join.
    ///
    /// # Errors
    /// Returns error if the session does not exist or the store fails.
    pub async fn force_reclaim(
        &self,
        session_id: SessionId,
    ) -> Result<TerminateOutcome, SessionError> {
        let result = self
            .store
            .terminate(
                session_id,
                TerminalStatus::Ghost,
                REASON_FORCED_CLEANUP,
                self.clock.now(),
            )
            .await;
        self.monitor.forget(session_id).await;

        let outcome = result?;
        if outcome == TerminateOutcome::Terminated {
            tracing::error!(
                session_id = %session_id,
                "Session forcibly reclaimed after failed heartbeats"
            );
        }
        Ok(outcome)
    }

    /// Run one ghost sweep now.
    ///
    /// # Errors
    /// Returns the storage failure; the next scheduled sweep retries.
    pub async fn cleanup_ghost_sessions(&self) -> Result<usize, SessionError> {
        let reclaimed = self.reaper.sweep().await?;
        for ghost in &reclaimed {
            self.monitor.forget(ghost.session_id).await;
        }
        Ok(reclaimed.len())
    }

    /// Active sessions with their heartbeat age, for dashboards.
    ///
    /// # Errors
    /// Returns error if the store fails.
    pub async fn active_sessions(&self) -> Result<Vec<ActiveSessionView>, SessionError> {
        Ok(self.store.active_sessions(self.clock.now()).await?)
    }

    /// The room's active session, if any.
    ///
    /// # Errors
    /// Returns [`SessionError::InvariantViolation`] if more than one is found.
    pub async fn active_session_for_room(
        &self,
        room_id: &str,
    ) -> Result<Option<SessionId>, SessionError> {
        let active = self.store.active_for_room(room_id).await?;
        match active.as_slice() {
            [] => Ok(None),
            [session] => Ok(Some(session.id)),
            many => {
                let active: Vec<SessionId> = many.iter().map(|s| s.id).collect();
                tracing::error!(room_id, active = ?active, "Multiple active sessions for one room");
                Err(SessionError::InvariantViolation {
                    room_id: room_id.to_string(),
                    active,
                })
            }
        }
    }

    /// # Errors
    /// Returns error if the store fails.
    pub async fn get_session(
        &self,
        session_id: SessionId,
    ) -> Result<Option<Session>, SessionError> {
        Ok(self.store.get(session_id).await?)
    }
}
