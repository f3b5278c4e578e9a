//! Ghost reaper: scheduled sweep that demotes sessions whose heartbeat went silent.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use room_sessions_core::{Clock, LivenessPolicy, SessionStore, traits::ReclaimedSession};
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

use crate::{error::SessionError, manager::SessionManager};

/// Consecutive failed sweeps after which every further failure logs at error.
pub const ALARM_AFTER_FAILED_SWEEPS: u32 = 2;

/// Reclaims active sessions whose heartbeat age reached the kill threshold.
pub struct GhostReaper<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    policy: LivenessPolicy,
    consecutive_failures: AtomicU32,
}

impl<S> GhostReaper<S>
where
    S: SessionStore,
{
    #[must_use]
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, policy: LivenessPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Run one sweep and return the sessions it demoted.
    ///
    /// # Errors
    /// Returns the storage failure; the next scheduled sweep retries.
    pub async fn sweep(&self) -> Result<Vec<ReclaimedSession>, SessionError> {
        let now = self.clock.now();
        let reclaimed = match self
            .store
            .reclaim_stale(now, self.policy.stale_cutoff(now))
            .await
        {
            Ok(reclaimed) => reclaimed,
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= ALARM_AFTER_FAILED_SWEEPS {
                    tracing::error!(
                        consecutive_failures = failures,
                        error = %e,
                        "Ghost sweeps keep failing; stale sessions may be holding rooms"
                    );
                } else {
                    tracing::warn!(error = %e, "Ghost sweep failed, will retry next interval");
                }
                return Err(e.into());
            }
        };

        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous > 0 {
            tracing::info!(failed_sweeps = previous, "Ghost sweep recovered");
        }
        for ghost in &reclaimed {
            tracing::warn!(
                session_id = %ghost.session_id,
                room_id = %ghost.room_id,
                seconds_since_heartbeat = now.saturating_sub(ghost.last_heartbeat_at),
                "Reaped ghost session"
            );
        }
        if !reclaimed.is_empty() {
            tracing::info!(reclaimed = reclaimed.len(), "Ghost sweep complete");
        }
        Ok(reclaimed)
    }

    /// Run one sweep and return how many sessions it demoted.
    ///
    /// # Errors
    /// Returns the storage failure; the next scheduled sweep retries.
    pub async fn cleanup_ghost_sessions(&self) -> Result<usize, SessionError> {
        Ok(self.sweep().await?.len())
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}

/// Sweep on the policy's reaper interval until `shutdown` changes.
///
/// The first sweep runs immediately, which clears ghosts left by a crash.
pub fn spawn_reaper<S>(
    manager: Arc<SessionManager<S>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: SessionStore + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(manager.policy().reaper_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = manager.cleanup_ghost_sessions().await {
                tracing::debug!(error = %e, "Scheduled ghost sweep failed");
            }
        }

        tracing::info!("Ghost reaper stopped");
    })
}
