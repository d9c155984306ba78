//! API routes.

pub mod clouds;
pub mod events;
pub mod health;
pub mod resources;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/clouds", clouds::router())
        .nest("/events", events::router())
        .merge(resources::router())
}
