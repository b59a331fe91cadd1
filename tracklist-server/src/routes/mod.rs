use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;
use crate::handlers::{artwork, cache, health, tasks};

/// Every artwork, cache maintenance and task endpoint.
pub fn create_api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(artwork_routes())
        .merge(cache_routes())
        .merge(task_routes())
}

fn artwork_routes() -> Router<AppState> {
    Router::new()
        .route("/artwork-url", get(artwork::artwork_url))
        .route("/artwork/refresh", post(artwork::refresh_artwork))
        .route("/artwork/status", get(artwork::fetch_status))
        .route("/artwork/status/overview", get(artwork::fetch_overview))
        .route("/artwork/cache-missing", post(artwork::cache_missing))
        .route("/artwork/cache-batch", post(artwork::cache_batch))
}

fn cache_routes() -> Router<AppState> {
    Router::new()
        .route("/cache/cleanup-status", get(cache::cleanup_status))
        .route("/cache/cleanup", post(cache::run_cleanup))
        .route("/cache/memory-stats", get(cache::memory_stats))
        .route("/cache/memory/clear", post(cache::clear_memory))
        .route(
            "/cache/integrity",
            get(cache::integrity_check).post(cache::integrity_repair),
        )
        .route("/cache/statistics", get(cache::cache_statistics))
}

fn task_routes() -> Router<AppState> {
    Router::new()
        .route("/tasks/status", get(tasks::tasks_status))
        .route("/tasks/history", get(tasks::task_history))
        .route("/tasks/scheduled/cleanup-now", post(tasks::cleanup_now))
        .route("/tasks/{task_id}", get(tasks::task_detail))
}
