//! Atomic get-or-create of a room's active session.

use std::{sync::Arc, time::Duration};

use room_sessions_core::{
    Clock, LivenessPolicy, SessionStore, Settings, StorageError, traits::EnsureOutcome,
};

use crate::error::SessionError;

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.create_retry_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.create_retry_backoff_ms),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Resolves concurrent joins for the same room to a single active session.
pub struct SessionCreator<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: LivenessPolicy,
    retry: RetryPolicy,
}

impl<S> SessionCreator<S>
where
    S: SessionStore,
{
    #[must_use]
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        policy: LivenessPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            retry,
        }
    }

    /// Return the room's active session, creating or replacing it as needed.
    ///
    /// Lost creation races are resolved by re-reading the winner. Transient
    /// failures are retried with backoff up to the retry budget.
    ///
    /// # Errors
    /// Returns [`SessionError::Transient`] once retries are exhausted and
    /// [`SessionError::InvariantViolation`] if the room already has more than
    /// one active session.
    pub async fn ensure_active_session(
        &self,
        room_id: &str,
        tenant_id: &str,
    ) -> Result<EnsureOutcome, SessionError> {
        if room_id.trim().is_empty() || tenant_id.trim().is_empty() {
            return Err(SessionError::InvalidRequest(
                "room_id and tenant_id must be non-empty".to_string(),
            ));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let now = self.clock.now();
            let cutoff = self.policy.stale_cutoff(now);

            let result = self
                .store
                .ensure_active(room_id, tenant_id, now, cutoff)
                .await;
            let err = match result {
                Ok(outcome) => {
                    log_outcome(room_id, &outcome);
                    return Ok(outcome);
                }
                Err(err) => err,
            };

            match err {
                StorageError::InvariantViolation { room_id, active } => {
                    tracing::error!(
                        room_id = %room_id,
                        active = ?active,
                        "Multiple active sessions for one room; refusing to pick one"
                    );
                    return Err(SessionError::InvariantViolation { room_id, active });
                }
                StorageError::Conflict { .. } if attempt < self.retry.max_attempts => {
                    tracing::debug!(room_id, attempt, "Lost session creation race, re-reading");
                }
                err if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        room_id,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Session creation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                err if err.is_retryable() => {
                    tracing::error!(room_id, attempt, error = %err, "Session creation gave up");
                    return Err(SessionError::Transient {
                        attempts: attempt,
                        source: err,
                    });
                }
                err => return Err(err.into()),
            }
        }
    }
}

fn log_outcome(room_id: &str, outcome: &EnsureOutcome) {
    for ghost in &outcome.reclaimed {
        tracing::warn!(room_id, session_id = %ghost, "Reclaimed stale session on join");
    }
    if outcome.created {
        tracing::info!(
            room_id,
            session_id = %outcome.session_id,
            reclaimed = outcome.reclaimed.len(),
            "Created room session"
        );
    } else {
        tracing::debug!(room_id, session_id = %outcome.session_id, "Reusing active session");
    }
}
