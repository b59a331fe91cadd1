//! Fire-and-forget entry point for artwork caching.
//!
//! Keeps one status record per album and refuses to enqueue a second job
//! while the first is still processing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::worker::ArtworkCacheWorker;
use crate::artwork::EntityId;
use crate::clock::SharedClock;
use crate::database::ports::albums::AlbumStore;
use crate::error::{ArtworkError, Result};
use crate::scheduler::{BackgroundScheduler, TaskSpec};

/// Priority of explicitly requested batches.
pub const BULK_PRIORITY: u8 = 7;
/// Priority of the missing-artwork sweep.
pub const MISSING_PRIORITY: u8 = 8;
/// Albums queued per missing-artwork sweep by default.
pub const DEFAULT_MISSING_BATCH: usize = 10;

/// Progress of a tracked fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchState {
    /// Queued or running.
    Processing,
    /// Finished without error.
    Completed,
    /// Finished with an error.
    Failed,
}

/// Tracked fetch for one album.
#[derive(Debug, Clone, Serialize)]
pub struct FetchStatus {
    /// Current state.
    pub status: FetchState,
    /// Scheduler task running the fetch.
    pub task_id: String,
    /// When it was queued.
    pub started_at: DateTime<Utc>,
    /// When it finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counts across every tracked fetch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchOverview {
    /// Albums tracked.
    pub total: usize,
    /// Still processing.
    pub processing: usize,
    /// Completed.
    pub completed: usize,
    /// Failed.
    pub failed: usize,
}

/// Per-album result of a batch request.
#[derive(Debug, Clone, Serialize)]
pub struct TriggeredFetch {
    /// Requested album.
    pub entity_id: EntityId,
    /// Task id when the album was queued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Why it was not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a missing-artwork sweep.
#[derive(Debug, Clone, Serialize)]
pub struct MissingBatch {
    /// Albums queued.
    pub queued: usize,
    /// Their task ids.
    pub task_ids: Vec<String>,
}

/// Queues cache jobs on the background scheduler and tracks their progress per album.
#[derive(Clone)]
pub struct FetchTrigger {
    scheduler: BackgroundScheduler,
    worker: Arc<ArtworkCacheWorker>,
    albums: Arc<dyn AlbumStore>,
    clock: SharedClock,
    statuses: Arc<DashMap<EntityId, FetchStatus>>,
}

impl std::fmt::Debug for FetchTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchTrigger")
            .field("tracked", &self.statuses.len())
            .finish_non_exhaustive()
    }
}

impl FetchTrigger {
    /// Builds a trigger with no tracked fetches.
    pub fn new(
        scheduler: BackgroundScheduler,
        worker: Arc<ArtworkCacheWorker>,
        albums: Arc<dyn AlbumStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            scheduler,
            worker,
            albums,
            clock,
            statuses: Arc::new(DashMap::new()),
        }
    }

    /// Enqueues a cache job for the album and returns its task id, or the
    /// id of the job already processing it.
    pub fn trigger(&self, entity_id: EntityId, origin_url: &str, priority: u8) -> String {
        // The shard stays locked until the status is recorded, so a fast job's
        // callbacks cannot be overwritten by the processing marker.
        match self.statuses.entry(entity_id) {
            Entry::Occupied(existing) if existing.get().status == FetchState::Processing => {
                let task_id = existing.get().task_id.clone();
                debug!(entity_id, task_id = %task_id, "artwork fetch already in flight");
                task_id
            }
            entry => {
                let spec = self.build_task(entity_id, origin_url.to_string(), priority);
                let task_id = self.scheduler.submit(spec);
                let status = FetchStatus {
                    status: FetchState::Processing,
                    task_id: task_id.clone(),
                    started_at: self.clock.now(),
                    completed_at: None,
                    error: None,
                };
                match entry {
                    Entry::Occupied(mut occupied) => {
                        occupied.insert(status);
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(status);
                    }
                }
                debug!(entity_id, task_id = %task_id, priority, "queued artwork fetch");
                task_id
            }
        }
    }

    fn build_task(&self, entity_id: EntityId, origin_url: String, priority: u8) -> TaskSpec {
        let worker = self.worker.clone();
        let on_success = self.settle_fn(entity_id);
        let on_error = self.settle_fn(entity_id);

        TaskSpec::new(format!("cache_artwork_album_{entity_id}"), async move {
            let outcome = worker.cache(entity_id, &origin_url).await?;
            Ok(serde_json::to_value(outcome)?)
        })
        .priority(priority)
        .on_success(move |result| {
            let reason = match result.get("success").and_then(|v| v.as_bool()) {
                Some(false) => Some(
                    result
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .unwrap_or("not cached")
                        .to_string(),
                ),
                _ => None,
            };
            on_success(reason);
            Ok(())
        })
        .on_error(move |error| {
            on_error(Some(error.to_string()));
            Ok(())
        })
    }

    fn settle_fn(&self, entity_id: EntityId) -> impl FnOnce(Option<String>) + Send + 'static {
        let statuses = self.statuses.clone();
        let clock = self.clock.clone();
        move |error| {
            if let Some(mut status) = statuses.get_mut(&entity_id) {
                status.completed_at = Some(clock.now());
                match error {
                    Some(error) => {
                        warn!(entity_id, "artwork fetch failed: {error}");
                        status.status = FetchState::Failed;
                        status.error = Some(error);
                    }
                    None => {
                        status.status = FetchState::Completed;
                        status.error = None;
                    }
                }
            }
        }
    }

    /// Looks each album up and triggers those with an origin URL.
    pub async fn trigger_many(&self, ids: &[EntityId], priority: u8) -> Vec<TriggeredFetch> {
        let mut results = Vec::with_capacity(ids.len());
        for &entity_id in ids {
            let result = match self.albums.get_by_id(entity_id).await {
                Ok(Some(album)) => match album.origin() {
                    Some(url) => Ok(self.trigger(entity_id, url, priority)),
                    None => Err("no artwork URL".to_string()),
                },
                Ok(None) => Err("album not found".to_string()),
                Err(e) => Err(e.to_string()),
            };
            results.push(match result {
                Ok(task_id) => TriggeredFetch {
                    entity_id,
                    task_id: Some(task_id),
                    error: None,
                },
                Err(error) => TriggeredFetch {
                    entity_id,
                    task_id: None,
                    error: Some(error),
                },
            });
        }
        results
    }

    /// Queues albums that have an origin URL but no cached artwork.
    pub async fn cache_all_missing(&self, batch_size: usize) -> Result<MissingBatch> {
        if batch_size == 0 {
            return Err(ArtworkError::validation("batch_size must be positive"));
        }
        let albums = self.albums.list_missing_artwork(batch_size).await?;
        let task_ids: Vec<String> = albums
            .iter()
            .filter_map(|album| {
                album
                    .origin()
                    .map(|url| self.trigger(album.id, url, MISSING_PRIORITY))
            })
            .collect();

        info!(queued = task_ids.len(), "queued missing artwork");
        Ok(MissingBatch {
            queued: task_ids.len(),
            task_ids,
        })
    }

    /// Tracked fetch for one album.
    pub fn status(&self, entity_id: EntityId) -> Option<FetchStatus> {
        self.statuses.get(&entity_id).map(|status| status.clone())
    }

    /// Counts across every tracked fetch.
    pub fn overall_status(&self) -> FetchOverview {
        let mut overview = FetchOverview::default();
        for status in self.statuses.iter() {
            overview.total += 1;
            match status.status {
                FetchState::Processing => overview.processing += 1,
                FetchState::Completed => overview.completed += 1,
                FetchState::Failed => overview.failed += 1,
            }
        }
        overview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artwork::ArtworkSubject;
    use crate::clock::SystemClock;
    use crate::database::memory::{InMemoryAlbumStore, InMemoryCacheEntryRepository};
    use crate::fetch::origin::{FetchedImage, OriginFetcher};
    use crate::fetch::processor::sample_png;
    use crate::file_cache::CacheLayout;
    use crate::memory_cache::{ArtworkMemoryCache, MemoryCacheConfig};
    use crate::scheduler::SchedulerConfig;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    /// Serves a PNG once the test releases the gate.
    struct GatedFetcher {
        gate: Semaphore,
    }

    #[async_trait]
    impl OriginFetcher for GatedFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedImage> {
            let _permit = self.gate.acquire().await.map_err(|e| ArtworkError::internal(e.to_string()))?;
            if url.contains("broken") {
                return Err(ArtworkError::Fetch("HTTP 500".into()));
            }
            Ok(FetchedImage {
                bytes: sample_png(32, 32),
                content_type: "image/png".into(),
                etag: None,
            })
        }
    }

    async fn setup() -> (TempDir, FetchTrigger, BackgroundScheduler, Arc<GatedFetcher>) {
        let dir = TempDir::new().unwrap();
        let clock: SharedClock = Arc::new(SystemClock);
        let albums = Arc::new(InMemoryAlbumStore::new());
        albums
            .insert(ArtworkSubject::new(1, Some("https://x/a.jpg".into())))
            .await;
        albums
            .insert(ArtworkSubject::new(2, Some("https://x/broken.jpg".into())))
            .await;
        albums.insert(ArtworkSubject::new(3, None)).await;

        let fetcher = Arc::new(GatedFetcher {
            gate: Semaphore::new(0),
        });
        let worker = Arc::new(ArtworkCacheWorker::new(
            Arc::new(InMemoryCacheEntryRepository::new()),
            albums.clone(),
            fetcher.clone(),
            Arc::new(CacheLayout::new(dir.path(), "/static/artwork_cache")),
            Arc::new(ArtworkMemoryCache::new(MemoryCacheConfig::default(), clock.clone())),
            clock.clone(),
        ));
        let scheduler = BackgroundScheduler::new(SchedulerConfig::default(), clock.clone());
        scheduler.start();
        let trigger = FetchTrigger::new(scheduler.clone(), worker, albums, clock);
        (dir, trigger, scheduler, fetcher)
    }

    #[tokio::test]
    async fn duplicate_trigger_returns_in_flight_task() {
        let (_dir, trigger, scheduler, fetcher) = setup().await;

        let first = trigger.trigger(1, "https://x/a.jpg", 5);
        let second = trigger.trigger(1, "https://x/a.jpg", 5);
        assert_eq!(first, second);
        assert_eq!(trigger.overall_status().processing, 1);

        fetcher.gate.add_permits(10);
        assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);

        let status = trigger.status(1).unwrap();
        assert_eq!(status.status, FetchState::Completed);
        assert!(status.completed_at.is_some());

        let third = trigger.trigger(1, "https://x/a.jpg", 5);
        assert_ne!(first, third);
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn failures_are_recorded_per_album() {
        let (_dir, trigger, scheduler, fetcher) = setup().await;
        fetcher.gate.add_permits(10);

        let results = trigger.trigger_many(&[2, 3, 404], BULK_PRIORITY).await;
        assert!(results[0].task_id.is_some());
        assert!(results[1].error.is_some());
        assert!(results[2].error.is_some());

        assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
        let status = trigger.status(2).unwrap();
        assert_eq!(status.status, FetchState::Failed);
        assert!(status.error.unwrap().contains("HTTP 500"));
        assert!(trigger.status(3).is_none());
        scheduler.stop().await;
    }

    #[tokio::test]
    async fn cache_all_missing_queues_albums_with_urls() {
        let (_dir, trigger, scheduler, fetcher) = setup().await;
        fetcher.gate.add_permits(10);

        let batch = trigger.cache_all_missing(DEFAULT_MISSING_BATCH).await.unwrap();
        assert_eq!(batch.queued, 2);
        assert!(trigger.cache_all_missing(0).await.is_err());

        assert!(scheduler.wait_until_idle(Duration::from_secs(5)).await);
        let overview = trigger.overall_status();
        assert_eq!(overview.total, 2);
        assert_eq!(overview.completed, 1);
        assert_eq!(overview.failed, 1);
        scheduler.stop().await;
    }
}
