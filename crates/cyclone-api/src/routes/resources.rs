//! Fleet capacity and worker listing endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use cyclone_core::{Resource, WorkerInstance};
use indexmap::IndexMap;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/resources", get(list_resources))
        .route("/workers", get(list_workers))
}

/// Per-cloud limit/used plus the `_total` aggregate.
async fn list_resources(
    State(state): State<AppState>,
) -> Result<Json<IndexMap<String, Resource>>, ApiError> {
    Ok(Json(state.controller().resources().await?))
}

async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<IndexMap<String, Vec<WorkerInstance>>>, ApiError> {
    Ok(Json(state.controller().list_workers().await?))
}
