use axum::{
    Router,
    routing::{delete, get, put},
};

use super::handler;
use crate::handler::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:token/v1/library/:entitlement_id/state", get(handler::get_reading_state))
        .route("/:token/v1/library/:entitlement_id/state", put(handler::put_reading_state))
        .route("/:token/v1/library/:entitlement_id", delete(handler::delete_reading_state))
}
