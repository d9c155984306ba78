//! Application state.

use cyclone_cloud::CloudController;
use cyclone_db::CloudRepo;
use cyclone_scheduler::{EventManager, SchedulerContext};
use sqlx::PgPool;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SchedulerContext>,
    pub manager: Arc<EventManager>,
    pub cloud_repo: Arc<dyn CloudRepo>,
    /// Absent when running on the in-memory stores.
    pub pool: Option<PgPool>,
}

impl AppState {
    pub fn new(
        ctx: Arc<SchedulerContext>,
        manager: Arc<EventManager>,
        cloud_repo: Arc<dyn CloudRepo>,
        pool: Option<PgPool>,
    ) -> Self {
        Self {
            ctx,
            manager,
            cloud_repo,
            pool,
        }
    }

    pub fn controller(&self) -> &CloudController {
        &self.ctx.controller
    }
}
