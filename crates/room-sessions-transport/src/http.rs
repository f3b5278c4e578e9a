//! HTTP transport for session lifecycle and monitoring.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use room_sessions_core::{SessionId, SessionStore, traits::ActiveSessionView};
use room_sessions_lifecycle::{Beat, SessionError, SessionManager, beat};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::protocol::{
    CloseSessionRequest, CloseSessionResponse, CreateSessionRequest, CreateSessionResponse,
    ErrorResponse, HeartbeatResponse, SweepResponse,
};

/// Error returned by route handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Session(SessionError::InvalidRequest(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Session(SessionError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Session(SessionError::Transient { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Session(SessionError::Storage(e)) if e.is_retryable() => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Session(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type Shared<S> = State<Arc<SessionManager<S>>>;

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("Invalid session id: {raw}")))
}

async fn create_session<S>(
    State(manager): Shared<S>,
    Path(room_id): Path<String>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError>
where
    S: SessionStore + 'static,
{
    let session_id = manager
        .ensure_active_session(&room_id, &body.tenant_id)
        .await?;
    Ok(Json(CreateSessionResponse { session_id }))
}

async fn heartbeat<S>(
    State(manager): Shared<S>,
    Path(session_id): Path<String>,
) -> Result<Json<HeartbeatResponse>, ApiError>
where
    S: SessionStore + 'static,
{
    let session_id = parse_session_id(&session_id)?;
    let response = match beat(&manager, session_id).await {
        Beat::Healthy => HeartbeatResponse {
            healthy: true,
            force_cleanup: false,
        },
        Beat::Missed { .. } => HeartbeatResponse {
            healthy: false,
            force_cleanup: false,
        },
        Beat::Reclaimed => HeartbeatResponse {
            healthy: false,
            force_cleanup: true,
        },
    };
    Ok(Json(response))
}

async fn close_session<S>(
    State(manager): Shared<S>,
    Path(session_id): Path<String>,
    body: Option<Json<CloseSessionRequest>>,
) -> Result<Json<CloseSessionResponse>, ApiError>
where
    S: SessionStore + 'static,
{
    let session_id = parse_session_id(&session_id)?;
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let outcome = manager.close_session(session_id, request.reason()).await?;
    let response = CloseSessionResponse::from_outcome(session_id, outcome);
    Ok(Json(response))
}

async fn active_sessions<S>(
    State(manager): Shared<S>,
) -> Result<Json<Vec<ActiveSessionView>>, ApiError>
where
    S: SessionStore + 'static,
{
    Ok(Json(manager.active_sessions().await?))
}

async fn sweep<S>(State(manager): Shared<S>) -> Result<Json<SweepResponse>, ApiError>
where
    S: SessionStore + 'static,
{
    let reclaimed = manager.cleanup_ghost_sessions().await?;
    Ok(Json(SweepResponse { reclaimed }))
}

/// Build the session router.
///
/// # Example
/// ```ignore
/// let app = router(Arc::new(SessionManager::new(MemoryStore::new(), policy)));
/// axum::serve(listener, app).await?;
/// ```
pub fn router<S>(manager: Arc<SessionManager<S>>) -> Router
where
    S: SessionStore + 'static,
{
    Router::new()
        .route("/rooms/{room_id}/session", post(create_session::<S>))
        .route("/sessions/active", get(active_sessions::<S>))
        .route("/sessions/{session_id}/heartbeat", post(heartbeat::<S>))
        .route("/sessions/{session_id}/close", post(close_session::<S>))
        .route("/reaper/sweep", post(sweep::<S>))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(manager)
}
