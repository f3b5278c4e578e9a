//! SQLite session storage (feature-gated).
//!
//! The single-active-session rule is enforced twice: by a partial unique index
//! on `room_id WHERE status = 'active'`, and by running get-or-create inside
//! one write transaction whose first statement is the stale reclaim, so the
//! write lock is held before the active row is read.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use room_sessions_core::traits::{
    ActiveSessionView, EnsureOutcome, HeartbeatWrite, REASON_HEARTBEAT_TIMEOUT, ReclaimedSession,
    RecoveryWrite, Session, SessionId, SessionStatus, SessionStore, StorageError, TerminalStatus,
    TerminateOutcome, Timestamp,
};
use sqlx::{
    Row, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS room_sessions (
        session_id TEXT PRIMARY KEY NOT NULL,
        room_id TEXT NOT NULL,
        tenant_id TEXT NOT NULL,
        status TEXT NOT NULL CHECK (status IN ('active', 'closed', 'ghost')),
        created_at INTEGER NOT NULL,
        last_heartbeat_at INTEGER NOT NULL,
        closed_at INTEGER,
        close_reason TEXT,
        recovery_attempts INTEGER NOT NULL DEFAULT 0,
        last_recovery_attempt_at INTEGER
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS room_sessions_one_active
        ON room_sessions (room_id) WHERE status = 'active'",
    "CREATE INDEX IF NOT EXISTS room_sessions_active_heartbeat
        ON room_sessions (last_heartbeat_at) WHERE status = 'active'",
    "CREATE VIEW IF NOT EXISTS active_room_sessions AS
        SELECT session_id, room_id, tenant_id, status, last_heartbeat_at,
               CAST(strftime('%s', 'now') AS INTEGER) - last_heartbeat_at AS seconds_since_heartbeat
        FROM room_sessions
        WHERE status = 'active'",
];

const SESSION_COLUMNS: &str = "session_id, room_id, tenant_id, status, created_at, \
     last_heartbeat_at, closed_at, close_reason, recovery_attempts, last_recovery_attempt_at";

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to a SQLite database and create the schema if needed.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the database cannot be opened.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::Internal(format!("invalid database url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // Every connection to `:memory:` is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(storage_error)?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and create the schema if needed.
    ///
    /// # Errors
    /// Returns error if the schema cannot be created.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(storage_error)?;
        }
        tracing::debug!("room_sessions schema ready");
        Ok(Self { pool })
    }

    async fn status_of(&self, id: SessionId) -> Result<Option<SessionStatus>, StorageError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM room_sessions WHERE session_id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;

        status.map(|s| s.parse()).transpose()
    }
}

fn storage_error(err: sqlx::Error) -> StorageError {
    match err {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. }
        | sqlx::Error::Configuration(_) => StorageError::Internal(err.to_string()),
        other => StorageError::Transient(other.to_string()),
    }
}

fn ensure_error(err: sqlx::Error, room_id: &str) -> StorageError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StorageError::Conflict {
                room_id: room_id.to_string(),
            };
        }
    }
    storage_error(err)
}

fn parse_id(raw: &str) -> Result<SessionId, StorageError> {
    Uuid::parse_str(raw).map_err(|e| StorageError::Internal(format!("bad session id {raw}: {e}")))
}

fn session_from_row(row: &SqliteRow) -> Result<Session, StorageError> {
    let id: String = row.try_get("session_id").map_err(storage_error)?;
    let status: String = row.try_get("status").map_err(storage_error)?;
    let attempts: i64 = row.try_get("recovery_attempts").map_err(storage_error)?;

    Ok(Session {
        id: parse_id(&id)?,
        room_id: row.try_get("room_id").map_err(storage_error)?,
        tenant_id: row.try_get("tenant_id").map_err(storage_error)?,
        status: status.parse()?,
        created_at: row.try_get("created_at").map_err(storage_error)?,
        last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(storage_error)?,
        closed_at: row.try_get("closed_at").map_err(storage_error)?,
        close_reason: row.try_get("close_reason").map_err(storage_error)?,
        recovery_attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_recovery_attempt_at: row
            .try_get("last_recovery_attempt_at")
            .map_err(storage_error)?,
    })
}

/// Demote stale active sessions, optionally limited to one room.
///
/// Shared by the creator's per-room reclaim and the reaper's sweep.
async fn reclaim_stale_rows<'e, E>(
    executor: E,
    room_id: Option<&str>,
    now: Timestamp,
    stale_cutoff: Timestamp,
) -> Result<Vec<ReclaimedSession>, sqlx::Error>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "UPDATE room_sessions
         SET status = 'ghost', closed_at = ?1, close_reason = ?2
         WHERE status = 'active'
           AND last_heartbeat_at <= ?3
           AND (?4 IS NULL OR room_id = ?4)
         RETURNING session_id, room_id, last_heartbeat_at",
    )
    .bind(now)
    .bind(REASON_HEARTBEAT_TIMEOUT)
    .bind(stale_cutoff)
    .bind(room_id)
    .fetch_all(executor)
    .await?;

    let mut reclaimed = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.try_get("session_id")?;
        reclaimed.push(ReclaimedSession {
            session_id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            room_id: row.try_get("room_id")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        });
    }
    Ok(reclaimed)
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn ensure_active(
        &self,
        room_id: &str,
        tenant_id: &str,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> Result<EnsureOutcome, StorageError> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;

        // Write first: takes the database write lock before the active row is read.
        let reclaimed: Vec<SessionId> =
            reclaim_stale_rows(&mut *tx, Some(room_id), now, stale_cutoff)
                .await
                .map_err(|e| ensure_error(e, room_id))?
                .into_iter()
                .map(|r| r.session_id)
                .collect();

        let active: Vec<String> = sqlx::query_scalar(
            "SELECT session_id FROM room_sessions WHERE room_id = ?1 AND status = 'active'",
        )
        .bind(room_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| ensure_error(e, room_id))?;

        let outcome = match active.as_slice() {
            [] => {
                let session_id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO room_sessions
                     (session_id, room_id, tenant_id, status, created_at, last_heartbeat_at, recovery_attempts)
                     VALUES (?1, ?2, ?3, 'active', ?4, ?4, 0)",
                )
                .bind(session_id.to_string())
                .bind(room_id)
                .bind(tenant_id)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| ensure_error(e, room_id))?;

                EnsureOutcome {
                    session_id,
                    created: true,
                    reclaimed,
                }
            }
            [existing] => EnsureOutcome {
                session_id: parse_id(existing)?,
                created: false,
                reclaimed,
            },
            many => {
                // Dropping the transaction rolls back the reclaim above.
                let active = many
                    .iter()
                    .map(|raw| parse_id(raw))
                    .collect::<Result<Vec<_>, _>>()?;
                return Err(StorageError::InvariantViolation {
                    room_id: room_id.to_string(),
                    active,
                });
            }
        };

        tx.commit().await.map_err(|e| ensure_error(e, room_id))?;
        Ok(outcome)
    }

    async fn reclaim_stale(
        &self,
        now: Timestamp,
        stale_cutoff: Timestamp,
    ) -> Result<Vec<ReclaimedSession>, StorageError> {
        reclaim_stale_rows(&self.pool, None, now, stale_cutoff)
            .await
            .map_err(storage_error)
    }

    async fn record_heartbeat(
        &self,
        id: SessionId,
        now: Timestamp,
    ) -> Result<HeartbeatWrite, StorageError> {
        let stored: Option<i64> = sqlx::query_scalar(
            "UPDATE room_sessions
             SET last_heartbeat_at = MAX(last_heartbeat_at, ?1), recovery_attempts = 0
             WHERE session_id = ?2 AND status = 'active'
             RETURNING last_heartbeat_at",
        )
        .bind(now)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        if let Some(at) = stored {
            return Ok(HeartbeatWrite::Recorded(at));
        }
        match self.status_of(id).await? {
            Some(status) => Ok(HeartbeatWrite::NotActive(status)),
            None => Err(StorageError::NotFound(id)),
        }
    }

    async fn record_recovery_attempt(
        &self,
        id: SessionId,
        now: Timestamp,
    ) -> Result<RecoveryWrite, StorageError> {
        let attempts: Option<i64> = sqlx::query_scalar(
            "UPDATE room_sessions
             SET recovery_attempts = recovery_attempts + 1, last_recovery_attempt_at = ?1
             WHERE session_id = ?2 AND status = 'active'
             RETURNING recovery_attempts",
        )
        .bind(now)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        if let Some(attempts) = attempts {
            return Ok(RecoveryWrite::Recorded(
                u32::try_from(attempts).unwrap_or(u32::MAX),
            ));
        }
        match self.status_of(id).await? {
            Some(status) => Ok(RecoveryWrite::NotActive(status)),
            None => Err(StorageError::NotFound(id)),
        }
    }

    async fn terminate(
        &self,
        id: SessionId,
        status: TerminalStatus,
        reason: &str,
        now: Timestamp,
    ) -> Result<TerminateOutcome, StorageError> {
        let result = sqlx::query(
            "UPDATE room_sessions
             SET status = ?1, closed_at = ?2, close_reason = ?3
             WHERE session_id = ?4 AND status = 'active'",
        )
        .bind(SessionStatus::from(status).as_str())
        .bind(now)
        .bind(reason)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 1 {
            return Ok(TerminateOutcome::Terminated);
        }
        match self.status_of(id).await? {
            Some(status) => Ok(TerminateOutcome::AlreadyTerminal(status)),
            None => Err(StorageError::NotFound(id)),
        }
    }

    async fn get(&self, id: SessionId) -> Result<Option<Session>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM room_sessions WHERE session_id = ?1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(session_from_row).transpose()
    }

    async fn active_for_room(&self, room_id: &str) -> Result<Vec<Session>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM room_sessions
             WHERE room_id = ?1 AND status = 'active'
             ORDER BY created_at DESC"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(session_from_row).collect()
    }

    async fn active_sessions(
        &self,
        now: Timestamp,
    ) -> Result<Vec<ActiveSessionView>, StorageError> {
        let rows = sqlx::query(
            "SELECT session_id, room_id, tenant_id, status, last_heartbeat_at,
                    ?1 - last_heartbeat_at AS seconds_since_heartbeat
             FROM room_sessions
             WHERE status = 'active'
             ORDER BY last_heartbeat_at ASC, room_id ASC",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("session_id").map_err(storage_error)?;
                let status: String = row.try_get("status").map_err(storage_error)?;
                Ok(ActiveSessionView {
                    session_id: parse_id(&id)?,
                    room_id: row.try_get("room_id").map_err(storage_error)?,
                    tenant_id: row.try_get("tenant_id").map_err(storage_error)?,
                    status: status.parse()?,
                    last_heartbeat_at: row.try_get("last_heartbeat_at").map_err(storage_error)?,
                    seconds_since_heartbeat: row
                        .try_get("seconds_since_heartbeat")
                        .map_err(storage_error)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::join_all;

    use super::*;

    const KILL: i64 = 90;

    async fn create(store: &impl SessionStore, room_id: &str, now: Timestamp) -> SessionId {
        let cutoff = now - KILL;
        let outcome = store.ensure_active(room_id, "t", now, cutoff).await;
        outcome.unwrap().session_id
    }

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_ensure_reuses_then_reclaims() {
        let store = memory_store().await;
        let first = store.ensure_active("room-1", "t", 0, -KILL).await.unwrap();
        let again = store.ensure_active("room-1", "t", 30, 30 - KILL).await;
        let again = again.unwrap();
        assert!(first.created);
        assert!(!again.created);
        assert_eq!(first.session_id, again.session_id);

        let replaced = store.ensure_active("room-1", "t", 90, 0).await.unwrap();
        assert!(replaced.created);
        assert_eq!(replaced.reclaimed, vec![first.session_id]);

        let old = store.get(first.session_id).await.unwrap().unwrap();
        assert_eq!(old.status, SessionStatus::Ghost);
        assert_eq!(old.close_reason.as_deref(), Some(REASON_HEARTBEAT_TIMEOUT));
        assert_eq!(store.active_for_room("room-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_second_active_row() {
        let store = memory_store().await;
        store.ensure_active("room-1", "t", 0, -KILL).await.unwrap();

        let err = sqlx::query(
            "INSERT INTO room_sessions
             (session_id, room_id, tenant_id, status, created_at, last_heartbeat_at)
             VALUES (?1, 'room-1', 't', 'active', 0, 0)",
        )
        .bind(Uuid::new_v4().to_string())
        .execute(&store.pool)
        .await
        .unwrap_err();
        assert!(matches!(
            ensure_error(err, "room-1"),
            StorageError::Conflict { .. }
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_close_and_view() {
        let store = memory_store().await;
        let id = create(&store, "room-1", 100).await;

        assert_eq!(
            store.record_recovery_attempt(id, 120).await.unwrap(),
            RecoveryWrite::Recorded(1)
        );
        assert_eq!(
            store.record_heartbeat(id, 130).await.unwrap(),
            HeartbeatWrite::Recorded(130)
        );
        assert_eq!(
            store.record_heartbeat(id, 125).await.unwrap(),
            HeartbeatWrite::Recorded(130)
        );

        let session = store.get(id).await.unwrap().unwrap();
        assert_eq!(session.recovery_attempts, 0);
        assert_eq!(session.last_recovery_attempt_at, Some(120));

        let view = store.active_sessions(140).await.unwrap();
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].seconds_since_heartbeat, 10);

        let closed = store
            .terminate(id, TerminalStatus::Closed, "bye", 150)
            .await;
        assert_eq!(closed.unwrap(), TerminateOutcome::Terminated);
        let again = store
            .terminate(id, TerminalStatus::Closed, "bye", 160)
            .await;
        assert_eq!(
            again.unwrap(),
            TerminateOutcome::AlreadyTerminal(SessionStatus::Closed)
        );
        assert_eq!(
            store.record_heartbeat(id, 170).await.unwrap(),
            HeartbeatWrite::NotActive(SessionStatus::Closed)
        );
        assert!(store.active_sessions(170).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reclaim_stale_sweep() {
        let store = memory_store().await;
        let stale = create(&store, "room-a", 0).await;
        create(&store, "room-b", 60).await;

        let reclaimed = store.reclaim_stale(100, 100 - KILL).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].session_id, stale);
        assert_eq!(reclaimed[0].room_id, "room-a");
        let again = store.reclaim_stale(100, 100 - KILL).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_missing_session() {
        let store = memory_store().await;
        let id = Uuid::new_v4();
        assert!(store.get(id).await.unwrap().is_none());
        assert!(matches!(
            store.record_heartbeat(id, 0).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_creates_one_row() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sessions.db").display());
        let store = Arc::new(SqliteStore::connect(&url).await.unwrap());

        let calls = (0..16).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.ensure_active("room-1", "t", 0, -KILL).await })
        });
        let ids: Vec<SessionId> = join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap().session_id)
            .collect();

        assert!(ids.iter().all(|id| *id == ids[0]));
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM room_sessions")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_replaces_stale_once() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("sessions.db").display());
        let store = Arc::new(SqliteStore::connect(&url).await.unwrap());
        let stale = create(store.as_ref(), "room-1", 0).await;

        let calls = (0..16).map(|_| {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.ensure_active("room-1", "t", 100, 100 - KILL).await })
        });
        let outcomes: Vec<EnsureOutcome> = join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        let replacement = outcomes[0].session_id;
        assert_ne!(replacement, stale);
        assert!(outcomes.iter().all(|o| o.session_id == replacement));
        let creators: Vec<&EnsureOutcome> = outcomes.iter().filter(|o| o.created).collect();
        assert_eq!(creators.len(), 1);
        assert_eq!(creators[0].reclaimed, vec![stale]);
        assert!(
            outcomes
                .iter()
                .filter(|o| !o.created)
                .all(|o| o.reclaimed.is_empty())
        );

        let counts: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM room_sessions GROUP BY status ORDER BY status",
        )
        .fetch_all(&store.pool)
        .await
        .unwrap();
        assert_eq!(
            counts,
            vec![("active".to_string(), 1), ("ghost".to_string(), 1)]
        );
    }
}
