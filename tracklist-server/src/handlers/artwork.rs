use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use tracklist_core::database::ports::albums::AlbumStore;
use tracklist_core::fetch::trigger::{
    BULK_PRIORITY, DEFAULT_MISSING_BATCH, MissingBatch, TriggeredFetch,
};
use tracklist_core::fetch::{FetchOverview, FetchStatus};
use tracklist_core::refresh::RefreshOutcome;
use tracklist_core::{ArtworkSubject, EntityId, SizeVariant};

use crate::infra::{
    app_state::AppState,
    errors::{AppError, AppResult},
};

const SESSION_HEADER: &str = "x-session-id";
const ANONYMOUS_CLIENT: &str = "anonymous";
const MAX_BATCH_IDS: usize = 500;

#[derive(Debug, Deserialize)]
pub struct ArtworkUrlQuery {
    /// Kept as text so a malformed id degrades to the placeholder.
    pub entity_id: Option<String>,
    pub size: Option<String>,
    pub fallback: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ArtworkUrlResponse {
    pub entity_id: Option<EntityId>,
    pub size: &'static str,
    pub url: String,
}

/// Best-effort artwork URL. Always answers 200.
pub async fn artwork_url(
    State(state): State<AppState>,
    Query(query): Query<ArtworkUrlQuery>,
) -> Json<ArtworkUrlResponse> {
    let size = SizeVariant::normalize(query.size.as_deref().unwrap_or_default());
    let fallback = query.fallback.as_deref().filter(|url| !url.trim().is_empty());
    let entity_id = query
        .entity_id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<EntityId>().ok());

    let Some(entity_id) = entity_id else {
        let url = fallback
            .unwrap_or(state.config().cache.placeholder_url.as_str())
            .to_string();
        return Json(ArtworkUrlResponse {
            entity_id: None,
            size: size.as_str(),
            url,
        });
    };

    let subject = match state.albums.get_by_id(entity_id).await {
        Ok(Some(subject)) => subject,
        Ok(None) => ArtworkSubject::new(entity_id, None),
        Err(e) => {
            warn!(entity_id, error = %e, "album lookup failed, resolving without origin");
            ArtworkSubject::new(entity_id, None)
        }
    };

    let url = state
        .resolver
        .resolve(&subject, size.as_str(), fallback)
        .await;
    Json(ArtworkUrlResponse {
        entity_id: Some(entity_id),
        size: size.as_str(),
        url,
    })
}

#[derive(Debug, Deserialize)]
pub struct RefreshQuery {
    pub entity_id: Option<EntityId>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: RefreshOutcome,
}

pub async fn refresh_artwork(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<RefreshQuery>,
) -> AppResult<Json<RefreshResponse>> {
    let entity_id = query
        .entity_id
        .ok_or_else(|| AppError::bad_request("entity_id is required"))?;
    let client_key = client_key(&headers, query.session_id.as_deref());

    let outcome = state.refresh.refresh(entity_id, &client_key).await?;
    Ok(Json(RefreshResponse {
        success: true,
        outcome,
    }))
}

/// Rate-limit identity: session header, then `session_id`, then anonymous.
pub fn client_key(headers: &HeaderMap, session_id: Option<&str>) -> String {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .or(session_id)
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .unwrap_or(ANONYMOUS_CLIENT)
        .to_string()
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub entity_id: EntityId,
}

pub async fn fetch_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> AppResult<Json<FetchStatus>> {
    state.trigger.status(query.entity_id).map(Json).ok_or_else(|| {
        AppError::not_found(format!(
            "No caching task found for album {}",
            query.entity_id
        ))
    })
}

pub async fn fetch_overview(State(state): State<AppState>) -> Json<FetchOverview> {
    Json(state.trigger.overall_status())
}

#[derive(Debug, Deserialize)]
pub struct CacheMissingQuery {
    pub batch_size: Option<usize>,
}

pub async fn cache_missing(
    State(state): State<AppState>,
    Query(query): Query<CacheMissingQuery>,
) -> AppResult<Json<MissingBatch>> {
    let batch = state
        .trigger
        .cache_all_missing(query.batch_size.unwrap_or(DEFAULT_MISSING_BATCH))
        .await?;
    Ok(Json(batch))
}

#[derive(Debug, Deserialize)]
pub struct CacheBatchRequest {
    pub entity_ids: Vec<EntityId>,
    pub priority: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct CacheBatchResponse {
    pub requested: usize,
    pub results: Vec<TriggeredFetch>,
}

pub async fn cache_batch(
    State(state): State<AppState>,
    Json(request): Json<CacheBatchRequest>,
) -> AppResult<Json<CacheBatchResponse>> {
    if request.entity_ids.is_empty() {
        return Err(AppError::bad_request("entity_ids must not be empty"));
    }
    if request.entity_ids.len() > MAX_BATCH_IDS {
        return Err(AppError::bad_request(format!(
            "At most {MAX_BATCH_IDS} entity_ids per request"
        )));
    }

    let results = state
        .trigger
        .trigger_many(&request.entity_ids, request.priority.unwrap_or(BULK_PRIORITY))
        .await;
    Ok(Json(CacheBatchResponse {
        requested: request.entity_ids.len(),
        results,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_key_prefers_header_then_query() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_key(&headers, None), "anonymous");
        assert_eq!(client_key(&headers, Some("q1")), "q1");
        assert_eq!(client_key(&headers, Some("  ")), "anonymous");

        headers.insert(SESSION_HEADER, HeaderValue::from_static("h1"));
        assert_eq!(client_key(&headers, Some("q1")), "h1");
    }
}
