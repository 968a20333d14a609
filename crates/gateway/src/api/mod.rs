pub mod admin;
pub mod audit;
pub mod auth;
pub mod context;
pub mod events;
pub mod ingest;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;

use fg_domain::Error;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (the embedded page's channel ingest,
/// which authenticates per-envelope via signatures, and the health probe)
/// and **protected** (collaborator endpoints gated behind the bearer-token
/// middleware).
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/v1/health", get(health))
        // Envelope ingest for the embedded page. No bearer token: every
        // message authenticates itself through the validation pipeline.
        .route("/v1/channel/ws", get(ingest::channel_ws));

    let protected = Router::new()
        // Session context (collaborator surface)
        .route("/v1/context", get(context::get_context))
        .route("/v1/context/update", post(context::update_context))
        .route("/v1/context/navigation", post(context::record_navigation))
        .route("/v1/context/assessment", post(context::set_assessment))
        .route("/v1/session", delete(context::end_session))
        .route("/v1/session/events", get(events::session_events_ws))
        // Audit trail (compliance dashboard)
        .route("/v1/audit/recent", get(audit::recent))
        // Admin
        .route("/v1/admin/keys", get(admin::key_ring))
        // Apply API auth middleware to all protected routes.
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Map a domain error onto an HTTP response.
pub(crate) fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::SessionNotFound(_) => StatusCode::NOT_FOUND,
        Error::Structural(_) | Error::Json(_) => StatusCode::BAD_REQUEST,
        Error::Security(_) => StatusCode::FORBIDDEN,
        Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, err.to_string())
}
