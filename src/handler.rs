use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
    routing::{get, put},
};
use serde::Serialize;

use tracing::info;

use crate::api::{APIResponse, ErrorResponse, ReadStatusRequest, StatusResponse, WebProgressRequest};
use crate::error::SyncError;
use crate::kobo::{self, SyncService};
use crate::model::{SyncSettings, User};
use crate::unpack_error;

#[derive(Clone)]
pub struct AppState {
    pub sync: Arc<SyncService>,
}

fn success<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(APIResponse { data })).into_response()
}

fn error(status: StatusCode, msg: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
        .into_response()
}

/// Maps a service error to a response. Only storage failures are logged;
/// the rest are the caller's mistake.
pub fn sync_error(err: &SyncError, action: &str) -> Response {
    match err {
        SyncError::UnknownToken => error(StatusCode::UNAUTHORIZED, "Unknown token"),
        SyncError::InvalidProgress(_) | SyncError::InvalidThresholds { .. } => error(StatusCode::BAD_REQUEST, &err.to_string()),
        SyncError::Storage(_) => {
            tracing::error!("Failed to {}: {}", action, unpack_error(err));
            error(StatusCode::INTERNAL_SERVER_ERROR, &format!("Failed to {action}"))
        }
    }
}

/// The user behind an `Authorization: Bearer <token>` header.
pub struct AuthUser(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty());

        let Some(token) = token else {
            return Err(error(StatusCode::UNAUTHORIZED, "Missing bearer token"));
        };

        state
            .sync
            .authenticate(token)
            .await
            .map(AuthUser)
            .map_err(|e| sync_error(&e, "authenticate request"))
    }
}

pub async fn healthcheck() -> impl IntoResponse {
    info!("got healthcheck request");
    Json(StatusResponse::new_from_msg("ok"))
}

pub async fn get_progress(State(state): State<AppState>, AuthUser(user): AuthUser, Path(book_id): Path<i64>) -> Response {
    match state.sync.progress(&user, book_id).await {
        Ok(Some(progress)) => success(progress),
        Ok(None) => error(StatusCode::NOT_FOUND, "Progress not found"),
        Err(e) => sync_error(&e, "get progress"),
    }
}

pub async fn update_progress(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(book_id): Path<i64>,
    Json(payload): Json<WebProgressRequest>,
) -> Response {
    match state.sync.record_web_progress(&user, book_id, payload).await {
        Ok(progress) => success(progress),
        Err(e) => sync_error(&e, "update progress"),
    }
}

pub async fn update_read_status(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(book_id): Path<i64>,
    Json(payload): Json<ReadStatusRequest>,
) -> Response {
    match state.sync.set_read_status(&user, book_id, payload.status).await {
        Ok(progress) => success(progress),
        Err(e) => sync_error(&e, "update read status"),
    }
}

pub async fn get_sync_settings(State(state): State<AppState>, AuthUser(user): AuthUser) -> Response {
    match state.sync.settings(user.id).await {
        Ok(settings) => success(settings),
        Err(e) => sync_error(&e, "get sync settings"),
    }
}

pub async fn update_sync_settings(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(payload): Json<SyncSettings>,
) -> Response {
    match state.sync.update_settings(user.id, payload).await {
        Ok(settings) => success(settings),
        Err(e) => sync_error(&e, "update sync settings"),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(healthcheck))
        .route("/api/books/:book_id/progress", get(get_progress).put(update_progress))
        .route("/api/books/:book_id/status", put(update_read_status))
        .route("/api/settings/sync", get(get_sync_settings).put(update_sync_settings))
        .nest("/kobo", kobo::routes())
        .with_state(state)
}
