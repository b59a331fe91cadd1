use axum::{extract::State, response::Json};
use serde::Serialize;

use tracklist_core::clock::Clock;
use tracklist_core::file_cache::StructureReport;

use crate::infra::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: &'static str,
    pub cache: StructureReport,
    pub scheduler_running: bool,
    pub queued_tasks: usize,
}

/// Degraded when the cache directories are missing or the scheduler has
/// been stopped.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = state.layout.verify_structure().await;
    let scheduler = state.scheduler.status();
    let healthy = cache.is_valid() && !scheduler.shutdown;

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        timestamp: state.clock.now(),
        version: env!("CARGO_PKG_VERSION"),
        cache,
        scheduler_running: !scheduler.shutdown,
        queued_tasks: scheduler.queued,
    })
}
