//! Collaborator HTTP surface over the session actors.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use fg_protocol::{AssessmentAction, AssessmentPayload, ContentRef, NavigationPayload};

use crate::api::{api_error, error_response};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SessionParams {
    pub session_id: String,
}

/// GET /v1/context?session_id= — the session's current context, or 404 when
/// the session neither runs nor has persisted state.
pub async fn get_context(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Response {
    let handle = match state.sessions.existing(&params.session_id) {
        Some(handle) => handle,
        None => return api_error(StatusCode::NOT_FOUND, "unknown session"),
    };
    match handle.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub session_id: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub current_content: Option<ContentRef>,
}

/// POST /v1/context/update — apply a page-context update, creating the
/// session on first touch.
pub async fn update_context(
    State(state): State<AppState>,
    Json(req): Json<UpdateRequest>,
) -> Response {
    if req.session_id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "sessionId must not be empty");
    }
    let handle = state.sessions.handle(&req.session_id);
    match handle
        .update_context(req.student_id, req.current_content)
        .await
    {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationRequest {
    pub session_id: String,
    pub content_id: String,
    pub page_type: String,
    pub url: String,
    #[serde(default)]
    pub previous_content_id: Option<String>,
}

/// POST /v1/context/navigation — record a page visit.
pub async fn record_navigation(
    State(state): State<AppState>,
    Json(req): Json<NavigationRequest>,
) -> Response {
    if req.session_id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "sessionId must not be empty");
    }
    let handle = state.sessions.handle(&req.session_id);
    let payload = NavigationPayload {
        content_id: req.content_id,
        page_type: req.page_type,
        url: req.url,
        previous_content_id: req.previous_content_id,
    };
    match handle.record_navigation(payload).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentRequest {
    pub session_id: String,
    pub assessment_id: String,
    pub action: AssessmentAction,
}

/// POST /v1/context/assessment — apply an assessment lifecycle signal.
pub async fn set_assessment(
    State(state): State<AppState>,
    Json(req): Json<AssessmentRequest>,
) -> Response {
    if req.session_id.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "sessionId must not be empty");
    }
    let handle = state.sessions.handle(&req.session_id);
    let payload = AssessmentPayload {
        assessment_id: req.assessment_id,
        action: req.action,
    };
    match handle.set_assessment_state(payload).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /v1/session?session_id= — end the session, removing durable and
/// in-memory state and notifying observers.
pub async fn end_session(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Response {
    let handle = match state.sessions.existing(&params.session_id) {
        Some(handle) => handle,
        None => return api_error(StatusCode::NOT_FOUND, "unknown session"),
    };
    match handle.end("client request").await {
        Ok(()) => {
            state.sessions.prune();
            Json(serde_json::json!({ "ended": params.session_id })).into_response()
        }
        Err(e) => error_response(e),
    }
}
