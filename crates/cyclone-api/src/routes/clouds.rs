//! Cloud administration endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Json, Router};
use cyclone_core::CloudConfig;
use cyclone_db::DbError;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_clouds).post(create_cloud))
        .route("/{name}", delete(delete_cloud))
        .route("/{name}/ping", get(ping_cloud))
}

#[derive(Debug, Serialize)]
struct CloudResponse {
    name: String,
    kind: String,
}

async fn list_clouds(State(state): State<AppState>) -> Result<Json<Vec<CloudResponse>>, ApiError> {
    let controller = state.controller();
    let mut clouds = Vec::new();
    for name in controller.cloud_names().await {
        let cloud = controller.get_cloud(&name).await?;
        clouds.push(CloudResponse {
            name,
            kind: cloud.kind().to_string(),
        });
    }
    Ok(Json(clouds))
}

/// Registers with the controller first so that a cloud which cannot be built
/// is never persisted.
async fn create_cloud(
    State(state): State<AppState>,
    Json(config): Json<CloudConfig>,
) -> Result<(StatusCode, Json<CloudResponse>), ApiError> {
    state.controller().add_cloud(&config).await?;
    if let Err(e) = state.cloud_repo.create(&config).await {
        warn!(cloud = %config.name, error = %e, "Failed to persist cloud, unregistering");
        if let Err(e) = state.controller().delete_cloud(&config.name).await {
            warn!(cloud = %config.name, error = %e, "Failed to unregister cloud");
        }
        return Err(e.into());
    }

    info!(cloud = %config.name, kind = %config.kind, "Cloud registered");
    Ok((
        StatusCode::CREATED,
        Json(CloudResponse {
            name: config.name,
            kind: config.kind,
        }),
    ))
}

async fn delete_cloud(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.controller().delete_cloud(&name).await?;
    // clouds from the configuration file are not in the store
    match state.cloud_repo.delete_by_name(&name).await {
        Ok(()) | Err(DbError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    info!(cloud = %name, "Cloud deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn ping_cloud(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.controller().ping(&name).await?;
    Ok(Json(json!({ "name": name, "status": "ok" })))
}
