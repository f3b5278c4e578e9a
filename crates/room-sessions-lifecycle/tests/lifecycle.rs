//! End-to-end session lifecycle scenarios against the in-memory store.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use room_sessions_core::{
    Clock, LivenessPolicy, ManualClock, Session, SessionId, SessionStatus,
    traits::{REASON_FORCED_CLEANUP, REASON_HEARTBEAT_TIMEOUT, TerminateOutcome},
};
use room_sessions_lifecycle::{
    HeartbeatExit, RetryPolicy, SessionError, SessionManager, spawn_heartbeat, spawn_reaper,
    storage::MemoryStore,
};
use tokio::sync::watch;
use tokio_test::assert_ok;

fn manager(clock: &Arc<ManualClock>) -> Arc<SessionManager<MemoryStore>> {
    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    };
    Arc::new(SessionManager::with_clock(
        MemoryStore::new(),
        LivenessPolicy::default(),
        Arc::clone(clock) as Arc<dyn Clock>,
        retry,
    ))
}

async fn join(manager: &SessionManager<MemoryStore>) -> SessionId {
    let joined = manager.ensure_active_session("room-r", "tenant-1").await;
    joined.unwrap()
}

async fn active_in_room(manager: &SessionManager<MemoryStore>, room_id: &str) -> usize {
    manager
        .active_sessions()
        .await
        .unwrap()
        .iter()
        .filter(|row| row.room_id == room_id)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_share_one_session() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);

    let joins = (0..32).map(|_| {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.ensure_active_session("room-r", "tenant-1").await })
    });
    let ids: Vec<_> = join_all(joins)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(manager.store().snapshot().unwrap().len(), 1);
}

#[tokio::test]
async fn simultaneous_joins_on_empty_room() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);

    let (a, b) = tokio::join!(
        manager.ensure_active_session("room-r", "tenant-1"),
        manager.ensure_active_session("room-r", "tenant-1"),
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(manager.store().snapshot().unwrap().len(), 1);
}

#[tokio::test]
async fn silent_connection_is_reaped_and_room_rejoins() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);

    let s1 = join(&manager).await;
    clock.set(30);
    assert!(manager.monitor_heartbeat(s1).await);
    clock.set(60);
    assert!(manager.monitor_heartbeat(s1).await);

    // Connection dies silently at t=65. At t=95 the heartbeat is only 35s old.
    clock.set(95);
    assert_eq!(manager.cleanup_ghost_sessions().await.unwrap(), 0);
    assert_eq!(active_in_room(&manager, "room-r").await, 1);

    // Heartbeat age reaches the kill threshold at t=150.
    clock.set(150);
    assert_eq!(manager.cleanup_ghost_sessions().await.unwrap(), 1);
    let s1_row = manager.get_session(s1).await.unwrap().unwrap();
    assert_eq!(s1_row.status, SessionStatus::Ghost);
    assert_eq!(
        s1_row.close_reason.as_deref(),
        Some(REASON_HEARTBEAT_TIMEOUT)
    );
    assert_eq!(active_in_room(&manager, "room-r").await, 0);
    let current = manager.active_session_for_room("room-r").await;
    assert_eq!(current.unwrap(), None);

    clock.set(155);
    let s2 = join(&manager).await;
    assert_ne!(s1, s2);
    let view = manager.active_sessions().await.unwrap();
    assert_eq!(view.len(), 1);
    assert_eq!(view[0].session_id, s2);
    assert_eq!(view[0].seconds_since_heartbeat, 0);

    // The ghost stays terminal.
    assert!(!manager.monitor_heartbeat(s1).await);
    assert!(manager.should_force_cleanup(s1).await);
}

#[tokio::test]
async fn join_reclaims_stale_session_without_waiting_for_sweep() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);

    let s1 = join(&manager).await;
    clock.set(90);
    let s2 = join(&manager).await;

    assert_ne!(s1, s2);
    assert_eq!(
        manager.get_session(s1).await.unwrap().unwrap().status,
        SessionStatus::Ghost
    );
    let current = manager.active_session_for_room("room-r").await;
    assert_eq!(current.unwrap(), Some(s2));
}

#[tokio::test]
async fn close_is_idempotent() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);
    let id = join(&manager).await;

    clock.set(10);
    let first = assert_ok!(manager.close_session(id, "disconnect").await);
    assert_eq!(first, TerminateOutcome::Terminated);
    let after_first = manager.get_session(id).await.unwrap().unwrap();

    clock.set(20);
    let second = assert_ok!(manager.close_session(id, "disconnect").await);
    assert_eq!(
        second,
        TerminateOutcome::AlreadyTerminal(SessionStatus::Closed)
    );
    assert_eq!(manager.get_session(id).await.unwrap().unwrap(), after_first);
    assert_eq!(after_first.closed_at, Some(10));

    // Next join mints a new session rather than reviving the closed one.
    let next = join(&manager).await;
    assert_ne!(next, id);
}

#[tokio::test]
async fn close_unknown_session_is_not_found() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);
    let err = manager
        .close_session(uuid::Uuid::new_v4(), "disconnect")
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::NotFound(_)));
}

#[tokio::test]
async fn invariant_violation_is_surfaced() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);
    for _ in 0..2 {
        manager
            .store()
            .seed(Session::new_active("room-r", "tenant-1", 0))
            .unwrap();
    }

    assert!(matches!(
        manager.active_session_for_room("room-r").await,
        Err(SessionError::InvariantViolation { .. })
    ));
    assert!(matches!(
        manager.ensure_active_session("room-r", "tenant-1").await,
        Err(SessionError::InvariantViolation { .. })
    ));
    // Nothing was auto-corrected.
    assert_eq!(active_in_room(&manager, "room-r").await, 2);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_task_reclaims_after_budget() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);
    let id = join(&manager).await;
    manager.store().fail_next_heartbeats(usize::MAX);

    let (_tx, rx) = watch::channel(false);
    let exit = spawn_heartbeat(Arc::clone(&manager), id, rx).await.unwrap();
    assert_eq!(exit, HeartbeatExit::Reclaimed(id));

    let row = manager.get_session(id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Ghost);
    assert_eq!(row.close_reason.as_deref(), Some(REASON_FORCED_CLEANUP));
    assert_eq!(row.recovery_attempts, 4);

    let replacement = join(&manager).await;
    assert_ne!(replacement, id);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_task_recovers_from_transient_misses() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);
    let id = join(&manager).await;
    manager.store().fail_next_heartbeats(2);

    let (tx, rx) = watch::channel(false);
    let handle = spawn_heartbeat(Arc::clone(&manager), id, rx);

    tokio::time::sleep(Duration::from_secs(30 * 4 + 1)).await;
    tx.send(true).unwrap();
    assert_eq!(handle.await.unwrap(), HeartbeatExit::Shutdown);

    let row = manager.get_session(id).await.unwrap().unwrap();
    assert_eq!(row.status, SessionStatus::Active);
    assert_eq!(row.recovery_attempts, 0);
    assert_eq!(row.last_recovery_attempt_at, Some(0));
}

#[tokio::test(start_paused = true)]
async fn scheduled_reaper_sweeps_until_shutdown() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(&clock);
    let id = join(&manager).await;
    clock.set(120);

    let (tx, rx) = watch::channel(false);
    let handle = spawn_reaper(Arc::clone(&manager), rx);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(
        manager.get_session(id).await.unwrap().unwrap().status,
        SessionStatus::Ghost
    );

    tx.send(true).unwrap();
    handle.await.unwrap();
}
