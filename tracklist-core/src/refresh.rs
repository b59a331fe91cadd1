//! Rate-limited manual refresh of one album's artwork.

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::artwork::EntityId;
use crate::database::ports::albums::AlbumStore;
use crate::database::ports::cache_entries::CacheEntryRepository;
use crate::error::{ArtworkError, Result};
use crate::fetch::FetchTrigger;
use crate::file_cache::{CacheLayout, remove_file_if_exists};
use crate::memory_cache::ArtworkMemoryCache;
use crate::rate_limit::{ArtworkRefreshLimiter, RefreshDecision};

/// Queue priority of a manual refresh; runs ahead of everything else.
pub const REFRESH_PRIORITY: u8 = 1;

/// Result of an accepted refresh.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    /// Refreshed album.
    pub entity_id: EntityId,
    /// Background fetch that will rebuild the artwork.
    pub task_id: String,
    /// Variant files deleted from disk.
    pub files_removed: usize,
    /// Index rows deleted.
    pub records_removed: u64,
    /// Window usage after this request was recorded.
    pub rate_limit: RefreshDecision,
}

/// Manual refresh: purge what is cached and fetch again, behind the refresh limiter.
pub struct RefreshService {
    limiter: Arc<ArtworkRefreshLimiter>,
    albums: Arc<dyn AlbumStore>,
    entries: Arc<dyn CacheEntryRepository>,
    layout: Arc<CacheLayout>,
    memory: Arc<ArtworkMemoryCache>,
    trigger: Arc<FetchTrigger>,
}

impl std::fmt::Debug for RefreshService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshService")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl RefreshService {
    /// Wires the service to the shared cache components.
    pub fn new(
        limiter: Arc<ArtworkRefreshLimiter>,
        albums: Arc<dyn AlbumStore>,
        entries: Arc<dyn CacheEntryRepository>,
        layout: Arc<CacheLayout>,
        memory: Arc<ArtworkMemoryCache>,
        trigger: Arc<FetchTrigger>,
    ) -> Self {
        Self {
            limiter,
            albums,
            entries,
            layout,
            memory,
            trigger,
        }
    }

    /// The limiter gating refreshes.
    pub fn limiter(&self) -> &ArtworkRefreshLimiter {
        &self.limiter
    }

    /// Drops every cached variant of the album and queues a fresh download
    /// ahead of all other work.
    ///
    /// The limit is checked before anything else, so a rejected client learns
    /// nothing about the album. Only validated requests count against it.
    pub async fn refresh(&self, entity_id: EntityId, client_key: &str) -> Result<RefreshOutcome> {
        let decision = self
            .limiter
            .check_refresh(client_key)
            .into_result()
            .inspect_err(|e| warn!(client_key, entity_id, "refresh rejected: {e}"))?;

        let album = self
            .albums
            .get_by_id(entity_id)
            .await?
            .ok_or_else(|| ArtworkError::not_found(format!("Album {entity_id} not found")))?;
        let origin = album
            .origin()
            .ok_or_else(|| {
                ArtworkError::validation(format!("Album {entity_id} has no artwork URL"))
            })?
            .to_string();

        self.limiter.record_refresh(client_key);

        let rows = self.entries.list_for_entity(entity_id).await?;
        let mut files_removed = 0;
        let mut keys = BTreeSet::new();
        for row in &rows {
            keys.insert(row.cache_key.clone());
            if let Some(path) = &row.file_path {
                match remove_file_if_exists(path).await {
                    Ok(true) => files_removed += 1,
                    Ok(false) => {}
                    Err(e) => warn!(path = %path.display(), "failed to remove cached variant: {e}"),
                }
            }
        }
        keys.insert(CacheLayout::generate_cache_key(&origin));
        for key in &keys {
            files_removed += self.layout.delete_key(key).await?;
        }

        let records_removed = self.entries.delete_for_entity(entity_id).await?;
        self.albums.clear_artwork_cached(entity_id).await?;
        self.memory.invalidate(entity_id, None);

        let task_id = self.trigger.trigger(entity_id, &origin, REFRESH_PRIORITY);
        info!(
            entity_id,
            client_key,
            files_removed,
            records_removed,
            task_id = %task_id,
            "artwork refresh queued"
        );

        Ok(RefreshOutcome {
            entity_id,
            task_id,
            files_removed,
            records_removed,
            rate_limit: decision,
        })
    }
}
