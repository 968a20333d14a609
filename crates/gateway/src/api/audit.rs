//! Audit-trail endpoint for the compliance dashboard.

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use crate::state::AppState;

const MAX_LIMIT: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct RecentParams {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// GET /v1/audit/recent?limit= — newest-first validation records.
pub async fn recent(
    State(state): State<AppState>,
    Query(params): Query<RecentParams>,
) -> impl IntoResponse {
    let limit = params.limit.min(MAX_LIMIT);
    let records = state.audit.recent(limit);
    Json(serde_json::json!({
        "count": records.len(),
        "records": records,
    }))
}
