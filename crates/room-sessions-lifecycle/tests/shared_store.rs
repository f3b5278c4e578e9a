//! Two service instances sharing one SQLite database.
#![cfg(feature = "sqlite")]

use std::{sync::Arc, time::Duration};

use room_sessions_core::{Clock, LivenessPolicy, ManualClock, SessionId, SessionStatus};
use room_sessions_lifecycle::{Beat, RetryPolicy, SessionManager, beat, storage::SqliteStore};
use tempfile::TempDir;

struct Cluster {
    _dir: TempDir,
    clock: Arc<ManualClock>,
    a: SessionManager<SqliteStore>,
    b: SessionManager<SqliteStore>,
}

async fn cluster() -> Cluster {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("sessions.db").display());
    let store = SqliteStore::connect(&url).await.unwrap();
    let clock = Arc::new(ManualClock::new(0));
    let instance = |store: SqliteStore| {
        SessionManager::with_clock(
            store,
            LivenessPolicy::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
            RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
            },
        )
    };
    let a = instance(store.clone());
    let b = instance(store);
    Cluster {
        _dir: dir,
        clock,
        a,
        b,
    }
}

async fn join(instance: &SessionManager<SqliteStore>) -> SessionId {
    let joined = instance.ensure_active_session("room-r", "tenant-1").await;
    joined.unwrap()
}

#[tokio::test]
async fn heartbeats_through_one_instance_keep_session_alive_on_the_other() {
    let c = cluster().await;
    let id = join(&c.a).await;

    for t in [30, 60, 90] {
        c.clock.set(t);
        assert!(c.b.monitor_heartbeat(id).await);
    }

    c.clock.set(95);
    assert!(!c.a.should_force_cleanup(id).await);
    assert_eq!(beat(&c.a, id).await, Beat::Healthy);
    assert_eq!(
        c.a.get_session(id).await.unwrap().unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn stored_reset_overrides_local_attempt_count() {
    let c = cluster().await;
    let id = join(&c.a).await;

    c.clock.set(20);
    for expected in 1..=4 {
        assert_eq!(c.a.increment_recovery_attempt(id).await, expected);
    }
    assert!(c.a.should_force_cleanup(id).await);

    c.clock.set(30);
    assert!(c.b.monitor_heartbeat(id).await);

    c.clock.set(35);
    assert!(!c.a.should_force_cleanup(id).await);
    assert_eq!(c.a.increment_recovery_attempt(id).await, 1);
}

#[tokio::test]
async fn session_closed_elsewhere_is_dropped_locally() {
    let c = cluster().await;
    let id = join(&c.a).await;
    assert!(c.a.health().state(id).await.is_some());

    c.b.close_session(id, "disconnect").await.unwrap();

    assert!(c.a.should_force_cleanup(id).await);
    assert_eq!(c.a.health().tracked_count().await, 0);
}
