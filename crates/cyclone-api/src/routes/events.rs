//! Event lifecycle endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use cyclone_core::{Event, EventId, EventStatus, NewEvent};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_events).post(submit_event))
        .route("/{id}", get(get_event).delete(delete_event))
        .route("/{id}/status", put(update_status))
}

fn parse_id(id: &str) -> Result<EventId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid event id {:?}: {}", id, e)))
}

async fn submit_event(
    State(state): State<AppState>,
    Json(req): Json<NewEvent>,
) -> Result<(StatusCode, Json<Event>), ApiError> {
    let event = state.manager.submit_event(req).await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// Events still in the active queue.
async fn list_events(State(state): State<AppState>) -> Result<Json<Vec<Event>>, ApiError> {
    Ok(Json(state.manager.list_events().await?))
}

async fn get_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Event>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.manager.get_event(id).await?))
}

async fn delete_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.manager.delete_event(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: EventStatus,
    #[serde(default)]
    error_message: Option<String>,
}

/// Completion callback used by workers.
async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StatusUpdate>,
) -> Result<Json<Event>, ApiError> {
    let id = parse_id(&id)?;
    let event = state
        .manager
        .complete_event(id, req.status, req.error_message)
        .await?;
    Ok(Json(event))
}
