//! HTTP Handlers for the device sync API

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::api::ReadingStatesRequest;
use crate::handler::{AppState, sync_error};

pub async fn put_reading_state(
    State(state): State<AppState>,
    Path((token, entitlement_id)): Path<(String, String)>,
    Json(payload): Json<ReadingStatesRequest>,
) -> Response {
    let user = match state.sync.authenticate(&token).await {
        Ok(user) => user,
        Err(e) => return sync_error(&e, "authenticate device"),
    };

    match state
        .sync
        .save_reading_states(&user, payload.reading_states, Some(&entitlement_id))
        .await
    {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => sync_error(&e, "save reading state"),
    }
}

pub async fn get_reading_state(
    State(state): State<AppState>,
    Path((token, entitlement_id)): Path<(String, String)>,
) -> Response {
    let user = match state.sync.authenticate(&token).await {
        Ok(user) => user,
        Err(e) => return sync_error(&e, "authenticate device"),
    };

    match state.sync.get_reading_state(&user, &entitlement_id).await {
        Ok(states) => (StatusCode::OK, Json(states)).into_response(),
        Err(e) => sync_error(&e, "get reading state"),
    }
}

/// The device removed the book. Answered with 204 whether or not a row
/// existed.
pub async fn delete_reading_state(
    State(state): State<AppState>,
    Path((token, entitlement_id)): Path<(String, String)>,
) -> Response {
    let user = match state.sync.authenticate(&token).await {
        Ok(user) => user,
        Err(e) => return sync_error(&e, "authenticate device"),
    };

    match state.sync.delete_reading_state(&user, &entitlement_id).await {
        Ok(_) => (StatusCode::NO_CONTENT, ()).into_response(),
        Err(e) => sync_error(&e, "delete reading state"),
    }
}
