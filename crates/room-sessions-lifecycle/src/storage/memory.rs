//! In-memory session storage.

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use room_sessions_core::traits::{
    ActiveSessionView, EnsureOutcome, HeartbeatWrite, REASON_HEARTBEAT_TIMEOUT, ReclaimedSession,
    RecoveryWrite, Session, SessionId, SessionStatus, SessionStore, StorageError, TerminalStatus,
    TerminateOutcome, Timestamp,
};

/// In-memory storage implementation.
///
/// Useful for development, tests and single-process deployments. Every
/// operation runs inside one critical section with no I/O, which gives the
/// same all-or-nothing behaviour as a database transaction. Data is lost on
/// restart.
pub struct MemoryStore {
    sessions: RwLock<HashMap<SessionId, Session>>,
    write_failures: AtomicUsize,
    heartbeat_failures: AtomicUsize,
    read_failures: AtomicUsize,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            write_failures: AtomicUsize::new(0),
            heartbeat_failures: AtomicUsize::new(0),
            read_failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` write operations fail with a transient error.
    pub fn fail_next_writes(&self, count: usize) {
        self.write_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` heartbeat writes fail with a transient error.
    pub fn fail_next_heartbeats(&self, count: usize) {
        self.heartbeat_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` single-session reads fail with a transient error.
    pub fn fail_next_reads(&self, count: usize) {
        self.read_failures.store(count, Ordering::SeqCst);
    }

    /// Insert a record verbatim, bypassing the atomic path.
    ///
    /// For fixtures and imports only.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn seed(&self, session: Session) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(session.id, session);
        Ok(())
    }

    /// Every stored record, oldest first.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn snapshot(&self) -> Result<Vec<Session>, StorageError> {
        let mut all: Vec<Session> = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|s| (s.created_at, s.id));
        Ok(all)
    }

    fn injected_failure(counter: &AtomicUsize) -> Result<(), StorageError> {
        let hit = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            Err(StorageError::Transient("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Demote stale active sessions, optionally limited to one room.
///
/// Shared by the creator's per-room reclaim and the reaper's sweep.
fn reclaim_stale_locked(
    sessions: &mut HashMap<SessionId, Session>,
    room_id: Option<&str>,
    now: Timestamp,
    stale_cutoff: Timestamp,
) -> Vec<ReclaimedSession> {
    let mut reclaimed = Vec::new();
    for session in sessions.values_mut() {
        if session.status != SessionStatus::Active || session.last_heartbeat_at > stale_cutoff {
            continue;
        }
        if room_id.is_some_and(|room| room != session.room_id) {
            continue;
        }
        session.status = SessionStatus::Ghost;
        session.closed_at = Some(now);
        session.close_reason = Some(REASON_HEARTBEAT_TIMEOUT.to_string());
        reclaimed.push(ReclaimedSession {
            session_id: session.id,
            room_id: session.room_id.clone(),
            last_heartbeat_at: session.last_heartbeat_at,
        });
    }
    reclaimed
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn ensure_active(
        &self,
        room_id: &str,
        tenant_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> Result<EnsureOutcome, StorageError> {
        Self::injected_failure(&self.write_failures)?;

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let active: Vec<SessionId> = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.room_id == room_id)
            .map(|s| s.id)
            .collect();
        if active.len() > 1 {
            return Err(StorageError::InvariantViolation {
                room_id: room_id.to_string(),
                active,
            });
        }

        let reclaimed: Vec<SessionId> =
            reclaim_stale_locked(&mut sessions, Some(room_id), now, stale_cutoff)
                .into_iter()
                .map(|r| r.session_id)
                .collect();

        if let Some(&existing) = active.first() {
            if !reclaimed.contains(&existing) {
                return Ok(EnsureOutcome {
                    session_id: existing,
                    created: false,
                    reclaimed,
                });
            }
        }

        let session = Session::new_active(room_id, tenant_id, now);
        let session_id = session.id;
        sessions.insert(session_id, session);

        Ok(EnsureOutcome {
            session_id,
            created: true,
            reclaimed,
        })
    }

    async fn reclaim_stale(
        &self,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> Result<Vec<ReclaimedSession>, StorageError> {
        Self::injected_failure(&self.write_failures)?;

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        Ok(reclaim_stale_locked(&mut sessions, None, now, stale_cutoff))
    }

    async fn record_heartbeat(
        &self,
        id: SessionId,
        now: Timestamp,
    ) -> Result<HeartbeatWrite, StorageError> {
        Self::injected_failure(&self.write_failures)?;
        Self::injected_failure(&self.heartbeat_failures)?;

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if session.status.is_terminal() {
            return Ok(HeartbeatWrite::NotActive(session.status));
        }

        session.last_heartbeat_at = session.last_heartbeat_at.max(now);
        session.recovery_attempts = 0;

        Ok(HeartbeatWrite::Recorded(session.last_heartbeat_at))
    }

    async fn record_recovery_attempt(
        &self,
        id: SessionId,
        now: Timestamp,
    ) -> Result<RecoveryWrite, StorageError> {
        Self::injected_failure(&self.write_failures)?;

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if session.status.is_terminal() {
            return Ok(RecoveryWrite::NotActive(session.status));
        }

        session.recovery_attempts = session.recovery_attempts.saturating_add(1);
        session.last_recovery_attempt_at = Some(now);

        Ok(RecoveryWrite::Recorded(session.recovery_attempts))
    }

    async fn terminate(
        &self,
        id: SessionId,
        status: TerminalStatus,
        reason: &str,
        now: Timestamp,
    ) -> Result<TerminateOutcome, StorageError> {
        Self::injected_failure(&self.write_failures)?;

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let session = sessions.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        if session.status.is_terminal() {
            return Ok(TerminateOutcome::AlreadyTerminal(session.status));
        }

        session.status = status.into();
        session.closed_at = Some(now);
        session.close_reason = Some(reason.to_string());

        Ok(TerminateOutcome::Terminated)
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        Self::injected_failure(&self.read_failures)?;

        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    async fn active_for_room(&self, room_id: &str) -> Result<Vec<Session>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<Session> = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active && s.room_id == room_id)
            .cloned()
            .collect();

        // Newest first
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(result)
    }

    async fn active_sessions(
        &self,
        now: Timestamp,
    ) -> Result<Vec<ActiveSessionView>, StorageError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<ActiveSessionView> = sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .map(|s| ActiveSessionView::from_session(s, now))
            .collect();

        result.sort_by(|a, b| {
            a.last_heartbeat_at
                .cmp(&b.last_heartbeat_at)
                .then_with(|| a.room_id.cmp(&b.room_id))
        });

        Ok(result)
    }
}
