//! Sync status and manual trigger.

use crate::{services::sync_service::SyncStatus, state::AppState};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

/// `GET /sync/status`
pub async fn sync_status(State(state): State<AppState>) -> Json<SyncStatus> {
    Json(state.sync.status())
}

/// `POST /sync`: request a cycle now. Returns immediately; the outcome
/// shows up in `/sync/status`.
pub async fn trigger_sync(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.sync.status();
    if status == SyncStatus::LocalOnly {
        return (StatusCode::CONFLICT, Json(status));
    }
    state.sync.trigger();
    (StatusCode::ACCEPTED, Json(status))
}
