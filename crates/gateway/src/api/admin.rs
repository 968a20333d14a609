//! Admin introspection endpoints.

use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// GET /v1/admin/keys — key-ring status: ids, lifetimes, active/grace
/// flags. Secret material never leaves the key manager.
pub async fn key_ring(State(state): State<AppState>) -> impl IntoResponse {
    let keys = state.keys.statuses();
    Json(serde_json::json!({
        "count": keys.len(),
        "keys": keys,
        "tracked_sessions": state.validator.tracked_sessions(),
        "live_actors": state.sessions.live_sessions(),
    }))
}
