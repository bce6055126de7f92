//! HTTP route handlers for the UI API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use engine::core::session::{Checkpoint, Session};
use engine::io::events::{Event, read_event_log};
use engine::io::persistence::SessionSummary;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/checkpoints/{after_step}", get(get_checkpoint))
        .route("/events", get(get_events))
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/sessions - summaries of every session under the state directory.
async fn list_sessions(State(state): State<AppState>) -> Result<Json<Vec<SessionSummary>>, StatusCode> {
    state.persistence().list_sessions().map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// GET /api/sessions/:id - full session record.
async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Session>, StatusCode> {
    state.persistence().load_session(&id).map(Json).map_err(|_| StatusCode::NOT_FOUND)
}

/// GET /api/sessions/:id/checkpoints/:after_step - a single checkpoint.
async fn get_checkpoint(State(state): State<AppState>, Path((id, after_step)): Path<(String, String)>) -> Result<Json<Checkpoint>, StatusCode> {
    state.persistence().restore_checkpoint(&id, &after_step).map(Json).map_err(|_| StatusCode::NOT_FOUND)
}

/// GET /api/events - the full durable event log, oldest first. Large logs
/// are better consumed incrementally via the `/events` SSE stream; this
/// exists for a one-shot dump (e.g. the dashboard's initial load before
/// the SSE connection opens).
async fn get_events(State(state): State<AppState>) -> Result<Json<Vec<Event>>, StatusCode> {
    read_event_log(&state.events_path()).map(Json).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}
