use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use tracklist_core::cleanup::{CleanupRun, CleanupStatus};
use tracklist_core::database::ports::cache_entries::CacheEntryRepository;
use tracklist_core::file_cache::{CacheFsStatistics, StructureReport};
use tracklist_core::integrity::{IntegrityReport, QuickCheckReport};
use tracklist_core::memory_cache::MemoryCacheStats;
use tracklist_core::resolver::ResolverStats;

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

pub async fn cleanup_status(State(state): State<AppState>) -> AppResult<Json<CleanupStatus>> {
    Ok(Json(state.cleanup.status().await?))
}

#[derive(Debug, Deserialize)]
pub struct CleanupQuery {
    pub dry_run: Option<bool>,
    pub retention_days: Option<u32>,
}

/// Runs a cleanup with the configured defaults, optionally overriding
/// `dry_run` and the retention period.
pub async fn run_cleanup(
    State(state): State<AppState>,
    Query(query): Query<CleanupQuery>,
) -> AppResult<Json<CleanupRun>> {
    let mut config = state.cleanup.defaults().clone();
    if let Some(dry_run) = query.dry_run {
        config.dry_run = dry_run;
    }
    if let Some(days) = query.retention_days {
        if days == 0 {
            return Err(AppError::bad_request("retention_days must be at least 1"));
        }
        config.default_retention_days = days;
    }

    info!(
        dry_run = config.dry_run,
        retention_days = config.default_retention_days,
        "manual cache cleanup requested"
    );
    let run = state.cleanup.cleanup(config).await?;
    Ok(Json(run))
}

#[derive(Debug, Serialize)]
pub struct MemoryStatsResponse {
    #[serde(flatten)]
    pub cache: MemoryCacheStats,
    pub resolver: ResolverStats,
}

pub async fn memory_stats(State(state): State<AppState>) -> Json<MemoryStatsResponse> {
    Json(MemoryStatsResponse {
        cache: state.memory.stats(),
        resolver: state.resolver.stats(),
    })
}

#[derive(Debug, Serialize)]
pub struct MemoryClearResponse {
    pub entries_cleared: usize,
}

pub async fn clear_memory(State(state): State<AppState>) -> Json<MemoryClearResponse> {
    let entries_cleared = state.memory.clear();
    info!(entries_cleared, "memory cache cleared on request");
    Json(MemoryClearResponse { entries_cleared })
}

#[derive(Debug, Deserialize)]
pub struct IntegrityQuery {
    pub quick: Option<bool>,
    pub repair: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum IntegrityResponse {
    Full(IntegrityReport),
    Quick(QuickCheckReport),
}

/// Read-only check; `repair` is only honoured on POST.
pub async fn integrity_check(
    State(state): State<AppState>,
    Query(query): Query<IntegrityQuery>,
) -> AppResult<Json<IntegrityResponse>> {
    run_integrity(&state, query, false).await
}

pub async fn integrity_repair(
    State(state): State<AppState>,
    Query(query): Query<IntegrityQuery>,
) -> AppResult<Json<IntegrityResponse>> {
    let repair = query.repair.unwrap_or(false);
    run_integrity(&state, query, repair).await
}

async fn run_integrity(
    state: &AppState,
    query: IntegrityQuery,
    repair: bool,
) -> AppResult<Json<IntegrityResponse>> {
    if query.quick.unwrap_or(false) {
        let report = state.integrity.quick_check().await?;
        return Ok(Json(IntegrityResponse::Quick(report)));
    }
    let report = state.integrity.verify(repair, query.limit).await;
    Ok(Json(IntegrityResponse::Full(report)))
}

#[derive(Debug, Serialize)]
pub struct IndexStatistics {
    pub entries: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct CacheStatisticsResponse {
    pub filesystem: CacheFsStatistics,
    pub structure: StructureReport,
    pub index: IndexStatistics,
}

pub async fn cache_statistics(
    State(state): State<AppState>,
) -> AppResult<Json<CacheStatisticsResponse>> {
    let filesystem = state.layout.statistics().await?;
    let structure = state.layout.verify_structure().await;
    let index = IndexStatistics {
        entries: state.entries.count().await?,
        total_bytes: state.entries.total_bytes().await?,
    };

    Ok(Json(CacheStatisticsResponse {
        filesystem,
        structure,
        index,
    }))
}
