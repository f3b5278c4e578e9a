//! Wire protocol for the session HTTP surface.

use room_sessions_core::{SessionId, SessionStatus, traits::TerminateOutcome};
use serde::{Deserialize, Serialize};

/// Body of `POST /rooms/{room_id}/session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    pub tenant_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    pub session_id: SessionId,
}

/// Result of one heartbeat write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub healthy: bool,
    /// The caller must drop the session id and join again.
    pub force_cleanup: bool,
}

/// Body of `POST /sessions/{session_id}/close`. An empty body is accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

impl CloseSessionRequest {
    /// Reason recorded when the client gives none.
    pub const DEFAULT_REASON: &'static str = "client_close";

    #[must_use]
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(Self::DEFAULT_REASON)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub session_id: SessionId,
    pub status: SessionStatus,
    /// The session was already closed or ghost before this call.
    pub already_terminal: bool,
}

impl CloseSessionResponse {
    #[must_use]
    pub const fn from_outcome(session_id: SessionId, outcome: TerminateOutcome) -> Self {
        match outcome {
            TerminateOutcome::Terminated => Self {
                session_id,
                status: SessionStatus::Closed,
                already_terminal: false,
            },
            TerminateOutcome::AlreadyTerminal(status) => Self {
                session_id,
                status,
                already_terminal: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepResponse {
    pub reclaimed: usize,
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
