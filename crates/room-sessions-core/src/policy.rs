//! Liveness policy: heartbeat cadence, kill threshold and recovery hysteresis.

use std::time::Duration;

use crate::{config::ConfigError, traits::Timestamp};

/// Validated timing constants for session liveness.
///
/// Construct through [`LivenessPolicy::new`] or [`crate::Settings::policy`];
/// both reject combinations that would flap on a single missed heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessPolicy {
    heartbeat_interval_seconds: u64,
    kill_threshold_seconds: u64,
    max_recovery_attempts: u32,
    reaper_interval_seconds: u64,
}

impl LivenessPolicy {
    /// Build a policy.
    ///
    /// `reaper_interval_seconds` defaults to half the kill threshold.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidPolicy`] if the kill threshold is shorter
    /// than two heartbeat intervals, the attempt budget is zero, or the reaper
    /// interval is zero or longer than half the kill threshold.
    pub fn new(
        heartbeat_interval_seconds: u64,
        kill_threshold_seconds: u64,
        max_recovery_attempts: u32,
        reaper_interval_seconds: Option<u64>,
    ) -> Result<Self, ConfigError> {
        if heartbeat_interval_seconds == 0 {
            return Err(ConfigError::InvalidPolicy(
                "heartbeat_interval_seconds must be positive".to_string(),
            ));
        }
        if kill_threshold_seconds < heartbeat_interval_seconds.saturating_mul(2) {
            return Err(ConfigError::InvalidPolicy(format!(
                "kill_threshold_seconds ({kill_threshold_seconds}) must be at least twice \
                 heartbeat_interval_seconds ({heartbeat_interval_seconds})"
            )));
        }
        if max_recovery_attempts == 0 {
            return Err(ConfigError::InvalidPolicy(
                "max_recovery_attempts must be at least 1".to_string(),
            ));
        }
        let reaper_interval_seconds = reaper_interval_seconds.unwrap_or(kill_threshold_seconds / 2);
        if reaper_interval_seconds == 0 || reaper_interval_seconds > kill_threshold_seconds / 2 {
            return Err(ConfigError::InvalidPolicy(format!(
                "reaper_interval_seconds ({reaper_interval_seconds}) must be between 1 and half \
                 of kill_threshold_seconds ({kill_threshold_seconds})"
            )));
        }

        Ok(Self {
            heartbeat_interval_seconds,
            kill_threshold_seconds,
            max_recovery_attempts,
            reaper_interval_seconds,
        })
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    #[must_use]
    pub const fn kill_threshold(&self) -> Duration {
        Duration::from_secs(self.kill_threshold_seconds)
    }

    #[must_use]
    pub const fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }

    #[must_use]
    pub const fn max_recovery_attempts(&self) -> u32 {
        self.max_recovery_attempts
    }

    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn kill_threshold_seconds(&self) -> i64 {
        self.kill_threshold_seconds as i64
    }

    /// Sessions whose last heartbeat is at or before this instant are stale.
    #[must_use]
    pub const fn stale_cutoff(&self, now: Timestamp) -> Timestamp {
        now.saturating_sub(self.kill_threshold_seconds())
    }

    /// Whether a heartbeat age has reached the kill threshold.
    #[must_use]
    pub const fn is_stale(&self, heartbeat_age_seconds: i64) -> bool {
        heartbeat_age_seconds >= self.kill_threshold_seconds()
    }

    /// Two-axis hysteresis: give up once the attempt budget is exceeded or the
    /// silence has lasted a full kill threshold.
    #[must_use]
    pub const fn should_force_cleanup(
        &self,
        recovery_attempts: u32,
        seconds_since_heartbeat: i64,
    ) -> bool {
        recovery_attempts > self.max_recovery_attempts || self.is_stale(seconds_since_heartbeat)
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 30,
            kill_threshold_seconds: 90,
            max_recovery_attempts: 3,
            reaper_interval_seconds: 45,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = LivenessPolicy::default();
        assert_eq!(policy, LivenessPolicy::new(30, 90, 3, None).unwrap());
        assert_eq!(policy.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(policy.reaper_interval(), Duration::from_secs(45));
    }

    #[test]
    fn test_force_cleanup_attempt_boundary() {
        let policy = LivenessPolicy::default();
        assert!(!policy.should_force_cleanup(2, 0));
        assert!(!policy.should_force_cleanup(3, 0));
        assert!(policy.should_force_cleanup(4, 0));
    }

    #[test]
    fn test_force_cleanup_elapsed_boundary() {
        let policy = LivenessPolicy::default();
        assert!(!policy.should_force_cleanup(0, 89));
        assert!(policy.should_force_cleanup(0, 90));
        assert!(policy.should_force_cleanup(0, 500));
    }

    #[test]
    fn test_stale_cutoff() {
        let policy = LivenessPolicy::default();
        assert_eq!(policy.stale_cutoff(1_000), 910);
        assert!(policy.is_stale(90));
        assert!(!policy.is_stale(89));
    }

    #[test]
    fn test_rejects_kill_threshold_below_two_beats() {
        let err = LivenessPolicy::new(30, 59, 3, None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPolicy(_)));
        assert!(LivenessPolicy::new(30, 60, 3, None).is_ok());
    }

    #[test]
    fn test_rejects_slow_reaper() {
        assert!(LivenessPolicy::new(30, 90, 3, Some(46)).is_err());
        assert!(LivenessPolicy::new(30, 90, 3, Some(0)).is_err());
        assert!(LivenessPolicy::new(30, 90, 3, Some(10)).is_ok());
    }

    #[test]
    fn test_rejects_zero_budget() {
        assert!(LivenessPolicy::new(30, 90, 0, None).is_err());
        assert!(LivenessPolicy::new(0, 90, 3, None).is_err());
    }
}
