//! Lifecycle error type.

use room_sessions_core::{SessionId, StorageError};

/// Session lifecycle error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(StorageError),
    #[error("Session store unavailable after {attempts} attempts: {source}")]
    Transient {
        attempts: u32,
        #[source]
        source: StorageError,
    },
    #[error("Room {room_id} has {} active sessions", .active.len())]
    InvariantViolation {
        room_id: String,
        active: Vec<SessionId>,
    },
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SessionError {
    /// Whether the caller may retry later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transient { .. } => true,
            Self::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => Self::NotFound(id),
            StorageError::InvariantViolation { room_id, active } => {
                Self::InvariantViolation { room_id, active }
            }
            StorageError::Transient(_) => Self::Transient {
                attempts: 1,
                source: err,
            },
            other => Self::Storage(other),
        }
    }
}
