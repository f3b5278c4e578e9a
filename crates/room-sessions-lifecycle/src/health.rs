//! Heartbeat health monitor.
//!
//! The store row is authoritative. Every decision reads it first and merges it
//! into the per-session [`HealthState`] cache; the cache alone decides only
//! while the store is unreachable. Terminal and unknown sessions are never
//! cached.

use std::{collections::HashMap, sync::Arc};

use room_sessions_core::{
    Clock, LivenessPolicy, Session, SessionId, SessionStore, StorageError, Timestamp,
    traits::{HeartbeatWrite, RecoveryWrite},
};
use tokio::sync::RwLock;

/// Liveness state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthState {
    /// Failed attempts since the last successful heartbeat.
    pub recovery_attempts: u32,
    /// Last heartbeat known to be stored.
    pub last_success_at: Timestamp,
    pub last_attempt_at: Option<Timestamp>,
    /// The store no longer holds this session as active.
    pub retired: bool,
}

impl HealthState {
    const fn healthy(at: Timestamp) -> Self {
        Self {
            recovery_attempts: 0,
            last_success_at: at,
            last_attempt_at: None,
            retired: false,
        }
    }

    const fn from_row(row: &Session) -> Self {
        Self {
            recovery_attempts: row.recovery_attempts,
            last_success_at: row.last_heartbeat_at,
            last_attempt_at: row.last_recovery_attempt_at,
            retired: row.status.is_terminal(),
        }
    }

    /// Merge a stored row into cached state.
    ///
    /// A stored heartbeat newer than the cached one means another writer reset
    /// the counter, so the stored count wins. Otherwise the higher count wins,
    /// which keeps attempts counted while store writes were failing.
    fn reconcile(self, row: &Session) -> Self {
        let recovery_attempts = if row.last_heartbeat_at > self.last_success_at {
            row.recovery_attempts
        } else {
            self.recovery_attempts.max(row.recovery_attempts)
        };
        Self {
            recovery_attempts,
            last_success_at: self.last_success_at.max(row.last_heartbeat_at),
            last_attempt_at: self.last_attempt_at.max(row.last_recovery_attempt_at),
            retired: row.status.is_terminal(),
        }
    }
}

/// Evaluates heartbeat outcomes with attempt-count and elapsed-time hysteresis.
pub struct HealthMonitor<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: LivenessPolicy,
    tracked: RwLock<HashMap<SessionId, HealthState>>,
}

impl<S> HealthMonitor<S>
where
    S: SessionStore,
{
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, policy: LivenessPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            tracked: RwLock::new(HashMap::new()),
        }
    }

    /// Start tracking a session that was just created or adopted.
    pub async fn track(&self, id: SessionId, last_heartbeat_at: Timestamp) {
        self.tracked
            .write()
            .await
            .entry(id)
            .or_insert_with(|| HealthState::healthy(last_heartbeat_at));
    }

    /// Drop tracking for a session that left the active state.
    pub async fn forget(&self, id: SessionId) {
        self.tracked.write().await.remove(&id);
    }

    /// Cached state, if any.
    pub async fn state(&self, id: SessionId) -> Option<HealthState> {
        self.tracked.read().await.get(&id).copied()
    }

    /// Number of sessions with cached state.
    pub async fn tracked_count(&self) -> usize {
        self.tracked.read().await.len()
    }

    /// Write a heartbeat.
    ///
    /// Returns `false` if the write failed or the session is no longer active.
    /// Never creates a replacement session; see [`Self::should_force_cleanup`].
    pub async fn monitor_heartbeat(&self, id: SessionId) -> bool {
        let now = self.clock.now();
        match self.store.record_heartbeat(id, now).await {
            Ok(HeartbeatWrite::Recorded(at)) => {
                self.tracked
                    .write()
                    .await
                    .insert(id, HealthState::healthy(at));
                tracing::debug!(session_id = %id, "Heartbeat recorded");
                true
            }
            Ok(HeartbeatWrite::NotActive(status)) => {
                tracing::warn!(
                    session_id = %id,
                    %status,
                    "Heartbeat rejected, session no longer active"
                );
                self.forget(id).await;
                false
            }
            Err(StorageError::NotFound(_)) => {
                tracing::warn!(session_id = %id, "Heartbeat rejected, session not found");
                self.forget(id).await;
                false
            }
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Heartbeat write failed");
                false
            }
        }
    }

    /// Whether the caller should give up on this session.
    ///
    /// True once `recovery_attempts` exceeds the budget, once the time since the
    /// last stored heartbeat reaches the kill threshold, or when the store no
    /// longer holds the session as active.
    pub async fn should_force_cleanup(&self, id: SessionId) -> bool {
        let Some(state) = self.load(id).await else {
            // Neither cache nor store can tell; don't evict on a blip.
            return false;
        };
        if state.retired {
            return true;
        }

        let elapsed = self.clock.now().saturating_sub(state.last_success_at);
        let force = self
            .policy
            .should_force_cleanup(state.recovery_attempts, elapsed);
        if force {
            tracing::warn!(
                session_id = %id,
                recovery_attempts = state.recovery_attempts,
                seconds_since_heartbeat = elapsed,
                "Session exceeded its recovery budget"
            );
        }
        force
    }

    /// Record one failed heartbeat attempt and return the new count.
    ///
    /// The count starts from the stored row merged with the cache. If the
    /// store write fails the cached count still advances.
    pub async fn increment_recovery_attempt(&self, id: SessionId) -> u32 {
        let now = self.clock.now();
        let base = self
            .load(id)
            .await
            .unwrap_or_else(|| HealthState::healthy(now));
        let mut attempts = base.recovery_attempts.saturating_add(1);

        match self.store.record_recovery_attempt(id, now).await {
            Ok(RecoveryWrite::Recorded(stored)) => {
                attempts = attempts.max(stored);
                tracing::debug!(session_id = %id, attempts, "Recovery attempt recorded");
            }
            Ok(RecoveryWrite::NotActive(_)) | Err(StorageError::NotFound(_)) => {
                self.forget(id).await;
                return attempts;
            }
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "Recovery attempt not persisted");
            }
        }

        self.tracked.write().await.insert(
            id,
            HealthState {
                recovery_attempts: attempts,
                last_attempt_at: Some(now),
                ..base
            },
        );
        attempts
    }

    /// Current state: the stored row merged with the cache, or the cache
    /// alone when the store cannot be read.
    async fn load(&self, id: SessionId) -> Option<HealthState> {
        let row = match self.store.get(id).await {
            Ok(row) => row,
            Err(e) => {
                let cached = self.state(id).await;
                if cached.is_none() {
                    tracing::warn!(session_id = %id, error = %e, "Could not load session health");
                }
                return cached;
            }
        };

        let Some(row) = row.filter(|r| !r.status.is_terminal()) else {
            self.forget(id).await;
            return Some(HealthState {
                retired: true,
                ..HealthState::healthy(self.clock.now())
            });
        };

        let mut tracked = self.tracked.write().await;
        let state = tracked
            .get(&id)
            .map_or_else(|| HealthState::from_row(&row), |cached| cached.reconcile(&row));
        tracked.insert(id, state);
        Some(state)
    }
}
