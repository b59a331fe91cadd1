use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};

use tracklist_core::scheduled::ScheduledStatus;
use tracklist_core::scheduler::{SchedulerStatus, TaskHistory, TaskRecord};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 200;

#[derive(Debug, Serialize)]
pub struct TasksStatusResponse {
    pub scheduler: SchedulerStatus,
    pub scheduled: ScheduledStatus,
}

pub async fn tasks_status(State(state): State<AppState>) -> Json<TasksStatusResponse> {
    Json(TasksStatusResponse {
        scheduler: state.scheduler.status(),
        scheduled: state.runner.status(),
    })
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn task_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Json<TaskHistory> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    Json(state.scheduler.history(limit))
}

pub async fn task_detail(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> AppResult<Json<TaskRecord>> {
    state
        .scheduler
        .task(&task_id)
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("Task {task_id} not found")))
}

#[derive(Debug, Deserialize)]
pub struct CleanupNowQuery {
    pub dry_run: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CleanupNowResponse {
    pub task_id: String,
    pub dry_run: bool,
}

pub async fn cleanup_now(
    State(state): State<AppState>,
    Query(query): Query<CleanupNowQuery>,
) -> Json<CleanupNowResponse> {
    let dry_run = query
        .dry_run
        .unwrap_or(state.runner.config().cleanup_dry_run);
    let task_id = state.runner.trigger_cleanup_now(Some(dry_run));
    Json(CleanupNowResponse { task_id, dry_run })
}
