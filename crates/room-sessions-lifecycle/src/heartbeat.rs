//! Periodic heartbeat task owned by a connection.

use std::sync::Arc;

use room_sessions_core::{SessionId, SessionStore};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{error::SessionError, manager::SessionManager};

/// Why a heartbeat task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// The owner asked the task to stop.
    Shutdown,
    /// The session was given up on; the owner must discard the id and call
    /// `ensure_active_session` again.
    Reclaimed(SessionId),
}

/// Outcome of a single heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    Healthy,
    /// The write failed and was counted as a recovery attempt.
    Missed { attempts: u32 },
    /// The session was given up on and marked ghost (or was already terminal).
    Reclaimed,
}

/// Perform one heartbeat for `session_id`.
///
/// A failed beat is counted with `increment_recovery_attempt` unless
/// `should_force_cleanup` already says to give up, in which case the session
/// is forcibly reclaimed.
pub async fn beat<S>(manager: &SessionManager<S>, session_id: SessionId) -> Beat
where
    S: SessionStore,
{
    if manager.monitor_heartbeat(session_id).await {
        return Beat::Healthy;
    }

    if manager.should_force_cleanup(session_id).await {
        match manager.force_reclaim(session_id).await {
            Ok(_) | Err(SessionError::NotFound(_)) => {}
            Err(e) => {
                // The reaper or the next join reclaims the slot instead.
                tracing::warn!(session_id = %session_id, error = %e, "Forced reclaim failed");
            }
        }
        return Beat::Reclaimed;
    }

    let attempts = manager.increment_recovery_attempt(session_id).await;
    tracing::debug!(session_id = %session_id, attempts, "Heartbeat missed");
    Beat::Missed { attempts }
}

/// Heartbeat `session_id` every heartbeat interval until shutdown or reclaim.
pub async fn run_heartbeat<S>(
    manager: Arc<SessionManager<S>>,
    session_id: SessionId,
    mut shutdown: watch::Receiver<bool>,
) -> HeartbeatExit
where
    S: SessionStore,
{
    let period = manager.policy().heartbeat_interval();
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                tracing::debug!(session_id = %session_id, "Heartbeat task stopped");
                return HeartbeatExit::Shutdown;
            }
        }

        if beat(&manager, session_id).await == Beat::Reclaimed {
            return HeartbeatExit::Reclaimed(session_id);
        }
    }
}

/// Spawn [`run_heartbeat`] on the runtime.
pub fn spawn_heartbeat<S>(
    manager: Arc<SessionManager<S>>,
    session_id: SessionId,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<HeartbeatExit>
where
    S: SessionStore + 'static,
{
    tokio::spawn(run_heartbeat(manager, session_id, shutdown))
}
