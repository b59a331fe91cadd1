#![allow(dead_code)]

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tracklist_core::cleanup::{CleanupConfig, CleanupEngine};
use tracklist_core::clock::{ManualClock, SharedClock};
use tracklist_core::database::memory::{InMemoryAlbumStore, InMemoryCacheEntryRepository};
use tracklist_core::fetch::processor::sample_png;
use tracklist_core::fetch::{ArtworkCacheWorker, FetchTrigger, FetchedImage, OriginFetcher};
use tracklist_core::file_cache::CacheLayout;
use tracklist_core::memory_cache::{ArtworkMemoryCache, MemoryCacheConfig};
use tracklist_core::rate_limit::ArtworkRefreshLimiter;
use tracklist_core::refresh::RefreshService;
use tracklist_core::reports::ReportWriter;
use tracklist_core::resolver::ArtworkResolver;
use tracklist_core::scheduler::{BackgroundScheduler, SchedulerConfig};
use tracklist_core::{ArtworkError, Result};

/// Serves a small PNG for any URL except those containing `missing`.
#[derive(Debug, Default)]
pub struct FakeOrigin {
    pub calls: AtomicUsize,
}

impl FakeOrigin {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginFetcher for FakeOrigin {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if url.contains("missing") {
            return Err(ArtworkError::Fetch(format!("HTTP 404 for {url}")));
        }
        Ok(FetchedImage {
            bytes: sample_png(240, 160),
            content_type: "image/png".to_string(),
            etag: None,
        })
    }
}

pub struct Stack {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub entries: Arc<InMemoryCacheEntryRepository>,
    pub albums: Arc<InMemoryAlbumStore>,
    pub layout: Arc<CacheLayout>,
    pub memory: Arc<ArtworkMemoryCache>,
    pub origin: Arc<FakeOrigin>,
    pub scheduler: BackgroundScheduler,
    pub trigger: Arc<FetchTrigger>,
    pub resolver: ArtworkResolver,
    pub refresh: RefreshService,
    pub cleanup: CleanupEngine,
}

impl Stack {
    pub fn cache_root(&self) -> &Path {
        self.layout.root()
    }
}

pub async fn stack() -> Stack {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let shared: SharedClock = clock.clone();
    let entries = Arc::new(InMemoryCacheEntryRepository::new());
    let albums = Arc::new(InMemoryAlbumStore::new());
    let layout = Arc::new(CacheLayout::new(
        dir.path().join("artwork_cache"),
        "/static/artwork_cache",
    ));
    layout.ensure_structure().await.unwrap();
    let memory = Arc::new(ArtworkMemoryCache::new(
        MemoryCacheConfig::default(),
        shared.clone(),
    ));
    let origin = Arc::new(FakeOrigin::default());
    let scheduler = BackgroundScheduler::new(SchedulerConfig::default(), shared.clone());

    let worker = Arc::new(ArtworkCacheWorker::new(
        entries.clone(),
        albums.clone(),
        origin.clone(),
        layout.clone(),
        memory.clone(),
        shared.clone(),
    ));
    let trigger = Arc::new(FetchTrigger::new(
        scheduler.clone(),
        worker,
        albums.clone(),
        shared.clone(),
    ));
    let resolver = ArtworkResolver::new(
        memory.clone(),
        entries.clone(),
        layout.clone(),
        trigger.clone(),
        shared.clone(),
    );
    let refresh = RefreshService::new(
        Arc::new(ArtworkRefreshLimiter::with_defaults(shared.clone())),
        albums.clone(),
        entries.clone(),
        layout.clone(),
        memory.clone(),
        trigger.clone(),
    );
    let cleanup = CleanupEngine::new(
        entries.clone(),
        layout.clone(),
        ReportWriter::new(dir.path().join("logs")),
        shared,
        CleanupConfig::default(),
    );

    Stack {
        dir,
        clock,
        entries,
        albums,
        layout,
        memory,
        origin,
        scheduler,
        trigger,
        resolver,
        refresh,
        cleanup,
    }
}
