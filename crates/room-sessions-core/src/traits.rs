//! Session records and the storage trait.

use std::{fmt, str::FromStr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Session identifier.
pub type SessionId = Uuid;

/// Seconds since the Unix epoch.
pub type Timestamp = i64;

/// Close reason recorded when the reaper or creator reclaims a stale session.
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";

/// Close reason recorded when the owning connection gives up on its session.
pub const REASON_FORCED_CLEANUP: &str = "forced_cleanup";

/// Session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session holds the room's active slot.
    Active,
    /// Session was closed gracefully.
    Closed,
    /// Session was reclaimed after its connection went silent.
    Ghost,
}

impl SessionStatus {
    /// Storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Ghost => "ghost",
        }
    }

    /// Closed and ghost sessions never return to active.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "ghost" => Ok(Self::Ghost),
            other => Err(StorageError::Internal(format!(
                "unknown session status: {other}"
            ))),
        }
    }
}

/// Terminal state a session can be moved into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Closed,
    Ghost,
}

impl From<TerminalStatus> for SessionStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Closed => Self::Closed,
            TerminalStatus::Ghost => Self::Ghost,
        }
    }
}

/// Persisted session data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Room whose active slot this session holds (or held).
    pub room_id: String,
    /// Tenant owning the room.
    pub tenant_id: String,
    /// Current status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: Timestamp,
    /// Last successful heartbeat write.
    pub last_heartbeat_at: Timestamp,
    /// Set on the transition out of active.
    pub closed_at: Option<Timestamp>,
    /// Why the session left the active state.
    pub close_reason: Option<String>,
    /// Failed heartbeat attempts since the last successful one.
    pub recovery_attempts: u32,
    /// When the most recent failed attempt was recorded.
    pub last_recovery_attempt_at: Option<Timestamp>,
}

impl Session {
    /// A fresh active session for `room_id`.
    #[must_use]
    pub fn new_active(room_id: &str, tenant_id: &str, now: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            tenant_id: tenant_id.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            last_heartbeat_at: now,
            closed_at: None,
            close_reason: None,
            recovery_attempts: 0,
            last_recovery_attempt_at: None,
        }
    }

    /// Seconds since the last successful heartbeat.
    #[must_use]
    pub const fn heartbeat_age(&self, now: Timestamp) -> i64 {
        now.saturating_sub(self.last_heartbeat_at)
    }
}

/// Row of the operational monitoring view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSessionView {
    pub session_id: SessionId,
    pub room_id: String,
    pub tenant_id: String,
    pub status: SessionStatus,
    pub last_heartbeat_at: Timestamp,
    pub seconds_since_heartbeat: i64,
}

impl ActiveSessionView {
    #[must_use]
    pub fn from_session(session: &Session, now: Timestamp) -> Self {
        Self {
            session_id: session.id,
            room_id: session.room_id.clone(),
            tenant_id: session.tenant_id.clone(),
            status: session.status,
            last_heartbeat_at: session.last_heartbeat_at,
            seconds_since_heartbeat: session.heartbeat_age(now),
        }
    }
}

/// Result of the atomic get-or-create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureOutcome {
    /// The room's active session after the operation.
    pub session_id: SessionId,
    /// Whether a new row was inserted.
    pub created: bool,
    /// Stale sessions demoted to ghost in the same step.
    pub reclaimed: Vec<SessionId>,
}

/// A session demoted by a stale sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedSession {
    pub session_id: SessionId,
    pub room_id: String,
    pub last_heartbeat_at: Timestamp,
}

/// Result of a heartbeat write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatWrite {
    /// Heartbeat stored; carries the stored `last_heartbeat_at`.
    Recorded(Timestamp),
    /// The session already left the active state.
    NotActive(SessionStatus),
}

/// Result of a recovery-attempt write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryWrite {
    /// Attempt stored; carries the new counter value.
    Recorded(u32),
    /// The session already left the active state.
    NotActive(SessionStatus),
}

/// Result of a terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// The session moved from active to the requested status.
    Terminated,
    /// The session was already terminal; nothing changed.
    AlreadyTerminal(SessionStatus),
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Transient storage failure: {0}")]
    Transient(String),
    #[error("Concurrent write conflict for room {room_id}")]
    Conflict { room_id: String },
    #[error("Room {room_id} has {} active sessions", .active.len())]
    InvariantViolation {
        room_id: String,
        active: Vec<SessionId>,
    },
    #[error("Storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Conflict { .. })
    }
}

/// Trait for session storage backends.
///
/// Every method is a single atomic operation against the store. Callers pass
/// `now` so that all timestamps come from one clock.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the room's active session, creating one if needed.
    ///
    /// Active sessions with `last_heartbeat_at <= stale_cutoff` are demoted to
    /// ghost and replaced in the same step.
    async fn ensure_active(
        &self,
        room_id: &str,
        tenant_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> Result<EnsureOutcome, StorageError>;

    /// Demote every active session with `last_heartbeat_at <= stale_cutoff`.
    async fn reclaim_stale(
        &self,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> Result<Vec<ReclaimedSession>, StorageError>;

    /// Store a successful heartbeat and reset the recovery counter.
    async fn record_heartbeat(
        &self,
        id: SessionId,
        now: Timestamp,
    ) -> Result<HeartbeatWrite, StorageError>;

    /// Count one failed heartbeat attempt.
    async fn record_recovery_attempt(
        &self,
        id: SessionId,
        now: Timestamp,
    ) -> Result<RecoveryWrite, StorageError>;

    /// Move an active session to a terminal status.
    async fn terminate(
        &self,
        id: SessionId,
        status: TerminalStatus,
        reason: &str,
        now: Timestamp,
    ) -> Result<TerminateOutcome, StorageError>;

    /// Get a session by ID.
    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError>;

    /// All active sessions recorded for a room. More than one is a defect.
    async fn active_for_room(&self, room_id: &str) -> Result<Vec<Session>, StorageError>;

    /// Active sessions with their heartbeat age, oldest heartbeat first.
    async fn active_sessions(&self, now: Timestamp)
    -> Result<Vec<ActiveSessionView>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [SessionStatus::Active, SessionStatus::Closed, SessionStatus::Ghost] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Closed.is_terminal());
        assert!(SessionStatus::Ghost.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Ghost).unwrap();
        assert_eq!(json, "\"ghost\"");
    }

    #[test]
    fn test_heartbeat_age() {
        let session = Session::new_active("room-1", "tenant-1", 100);
        assert_eq!(session.heartbeat_age(190), 90);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.recovery_attempts, 0);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(StorageError::Transient("io".into()).is_retryable());
        let conflict = StorageError::Conflict {
            room_id: "r".into(),
        };
        assert!(conflict.is_retryable());
        assert!(
            !StorageError::InvariantViolation {
                room_id: "r".into(),
                active: vec![],
            }
            .is_retryable()
        );
    }
}
