//! Best-effort URL resolution: memory, then the cache index, then the
//! origin, then a placeholder. Never fails and never waits on the network.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use crate::artwork::{ArtworkSubject, SizeVariant};
use crate::clock::SharedClock;
use crate::database::ports::cache_entries::CacheEntryRepository;
use crate::error::Result;
use crate::fetch::FetchTrigger;
use crate::file_cache::{CacheLayout, file_exists};
use crate::memory_cache::ArtworkMemoryCache;
use crate::scheduler::DEFAULT_PRIORITY;

/// Served when neither a cached file nor a fallback URL exists.
pub const DEFAULT_PLACEHOLDER: &str = "/static/img/album-placeholder.svg";

/// Resolution counters since startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResolverStats {
    /// Answered from memory or the cache index.
    pub cache_hits: u64,
    /// Fell through to the origin or a placeholder.
    pub cache_misses: u64,
    /// Returned the caller's fallback or the placeholder.
    pub fallback_used: u64,
    /// Index lookups that failed.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    fallback_used: AtomicU64,
    errors: AtomicU64,
}

/// Three-tier URL resolver backed by the memory cache and the cache index.
pub struct ArtworkResolver {
    memory: Arc<ArtworkMemoryCache>,
    entries: Arc<dyn CacheEntryRepository>,
    layout: Arc<CacheLayout>,
    trigger: Arc<FetchTrigger>,
    clock: SharedClock,
    placeholder: String,
    counters: Counters,
}

impl std::fmt::Debug for ArtworkResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtworkResolver")
            .field("placeholder", &self.placeholder)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl ArtworkResolver {
    /// Builds a resolver using [`DEFAULT_PLACEHOLDER`].
    pub fn new(
        memory: Arc<ArtworkMemoryCache>,
        entries: Arc<dyn CacheEntryRepository>,
        layout: Arc<CacheLayout>,
        trigger: Arc<FetchTrigger>,
        clock: SharedClock,
    ) -> Self {
        Self {
            memory,
            entries,
            layout,
            trigger,
            clock,
            placeholder: DEFAULT_PLACEHOLDER.to_string(),
            counters: Counters::default(),
        }
    }

    /// Overrides the placeholder URL.
    pub fn with_placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = placeholder.into();
        self
    }

    /// Returns the best URL currently available for the album's artwork.
    ///
    /// Unknown sizes resolve as `medium`. On a full miss with a known origin
    /// the origin URL is returned and a background fetch is queued.
    pub async fn resolve(
        &self,
        subject: &ArtworkSubject,
        size: &str,
        fallback: Option<&str>,
    ) -> String {
        let variant = SizeVariant::normalize(size);

        if let Some(url) = self.memory.get(subject.id, variant) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(entity_id = subject.id, %variant, "artwork memory hit");
            return url;
        }

        match self.lookup_index(subject, variant).await {
            Ok(Some(url)) => {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return url;
            }
            Ok(None) => {}
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(entity_id = subject.id, %variant, "artwork lookup failed, using fallback: {e}");
                return self.fallback(fallback);
            }
        }

        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        match subject.origin() {
            Some(origin) => {
                self.memory.set(
                    subject.id,
                    variant,
                    origin,
                    Some(json!({ "source": "origin" })),
                );
                if !subject.artwork_cached {
                    self.trigger.trigger(subject.id, origin, DEFAULT_PRIORITY);
                }
                origin.to_string()
            }
            None => self.fallback(fallback),
        }
    }

    async fn lookup_index(
        &self,
        subject: &ArtworkSubject,
        variant: SizeVariant,
    ) -> Result<Option<String>> {
        let Some(entry) = self.entries.find_variant(subject.id, variant).await? else {
            return Ok(None);
        };
        let Some(path) = entry.file_path.as_deref() else {
            return Ok(None);
        };
        if !file_exists(path).await {
            debug!(entity_id = subject.id, path = %path.display(), "indexed artwork missing on disk");
            return Ok(None);
        }
        let Some(url) = self.layout.web_path(path) else {
            return Ok(None);
        };

        self.entries.touch(entry.id, self.clock.now()).await?;
        self.memory.set(
            subject.id,
            variant,
            url.clone(),
            Some(json!({ "source": "file", "cache_key": entry.cache_key })),
        );
        debug!(entity_id = subject.id, %variant, "artwork file hit");
        Ok(Some(url))
    }

    fn fallback(&self, fallback: Option<&str>) -> String {
        self.counters.fallback_used.fetch_add(1, Ordering::Relaxed);
        fallback
            .filter(|url| !url.is_empty())
            .unwrap_or(&self.placeholder)
            .to_string()
    }

    /// Snapshot of the hit and miss counters.
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            fallback_used: self.counters.fallback_used.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artwork::CacheEntry;
    use crate::clock::SystemClock;
    use crate::database::memory::{InMemoryAlbumStore, InMemoryCacheEntryRepository};
    use crate::database::ports::cache_entries::MockCacheEntryRepository;
    use crate::error::ArtworkError;
    use crate::fetch::origin::{FetchedImage, OriginFetcher};
    use crate::fetch::ArtworkCacheWorker;
    use crate::memory_cache::MemoryCacheConfig;
    use crate::scheduler::{BackgroundScheduler, SchedulerConfig};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NeverFetcher;

    #[async_trait]
    impl OriginFetcher for NeverFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedImage> {
            Err(ArtworkError::Fetch(format!("offline: {url}")))
        }
    }

    struct Harness {
        dir: TempDir,
        resolver: ArtworkResolver,
        memory: Arc<ArtworkMemoryCache>,
        layout: Arc<CacheLayout>,
        scheduler: BackgroundScheduler,
    }

    /// The scheduler is never started so queued fetches stay observable.
    fn harness(entries: Arc<dyn CacheEntryRepository>) -> Harness {
        let dir = TempDir::new().unwrap();
        let clock: SharedClock = Arc::new(SystemClock);
        let memory = Arc::new(ArtworkMemoryCache::new(
            MemoryCacheConfig::default(),
            clock.clone(),
        ));
        let layout = Arc::new(CacheLayout::new(dir.path(), "/static/artwork_cache"));
        let albums = Arc::new(InMemoryAlbumStore::new());
        let scheduler = BackgroundScheduler::new(SchedulerConfig::default(), clock.clone());
        let worker = Arc::new(ArtworkCacheWorker::new(
            entries.clone(),
            albums.clone(),
            Arc::new(NeverFetcher),
            layout.clone(),
            memory.clone(),
            clock.clone(),
        ));
        let trigger = Arc::new(FetchTrigger::new(
            scheduler.clone(),
            worker,
            albums,
            clock.clone(),
        ));
        let resolver =
            ArtworkResolver::new(memory.clone(), entries, layout.clone(), trigger, clock);
        Harness {
            dir,
            resolver,
            memory,
            layout,
            scheduler,
        }
    }

    #[tokio::test]
    async fn memory_hit_skips_the_index() {
        // No expectations: any index call would panic the test.
        let h = harness(Arc::new(MockCacheEntryRepository::new()));
        h.memory.set(7, SizeVariant::Large, "/static/artwork_cache/large/k.jpg", None);

        let subject = ArtworkSubject::new(7, Some("https://x/a.jpg".into()));
        let url = h.resolver.resolve(&subject, "LARGE", None).await;
        assert_eq!(url, "/static/artwork_cache/large/k.jpg");
        assert_eq!(h.resolver.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn miss_returns_origin_and_queues_one_fetch() {
        let h = harness(Arc::new(InMemoryCacheEntryRepository::new()));
        let subject = ArtworkSubject::new(1, Some("https://x/a.jpg".into()));

        assert_eq!(h.resolver.resolve(&subject, "medium", None).await, "https://x/a.jpg");
        assert_eq!(h.scheduler.status().queued, 1);

        // Served from memory now; no second job.
        assert_eq!(h.resolver.resolve(&subject, "medium", None).await, "https://x/a.jpg");
        assert_eq!(h.scheduler.status().queued, 1);
        assert_eq!(h.resolver.stats().cache_misses, 1);
    }

    #[tokio::test]
    async fn indexed_file_resolves_to_web_path() {
        let entries = Arc::new(InMemoryCacheEntryRepository::new());
        let h = harness(entries.clone());
        h.layout.ensure_structure().await.unwrap();

        let path = h.layout.path_for("k1", SizeVariant::Small, None);
        tokio::fs::write(&path, b"jpeg").await.unwrap();
        let entry = CacheEntry::new(1, "https://x/a.jpg", "k1", SizeVariant::Small, chrono::Utc::now())
            .with_file(path, 4);
        entries.upsert(entry).await.unwrap();

        let subject = ArtworkSubject::new(1, Some("https://x/a.jpg".into()));
        let url = h.resolver.resolve(&subject, "small", None).await;
        assert_eq!(url, "/static/artwork_cache/small/k1.jpg");
        assert_eq!(h.scheduler.status().queued, 0);

        let row = entries.find_variant(1, SizeVariant::Small).await.unwrap().unwrap();
        assert_eq!(row.access_count, 1);
        assert!(h.dir.path().exists());
    }

    #[tokio::test]
    async fn no_origin_uses_fallback_then_placeholder() {
        let h = harness(Arc::new(InMemoryCacheEntryRepository::new()));
        let subject = ArtworkSubject::new(2, None);

        assert_eq!(
            h.resolver.resolve(&subject, "thumb", Some("/img/x.png")).await,
            "/img/x.png"
        );
        assert_eq!(h.resolver.resolve(&subject, "bogus", None).await, DEFAULT_PLACEHOLDER);
        assert_eq!(h.resolver.stats().fallback_used, 2);
        assert_eq!(h.scheduler.status().queued, 0);
    }

    #[tokio::test]
    async fn index_failure_degrades_to_fallback() {
        let mut repo = MockCacheEntryRepository::new();
        repo.expect_find_variant()
            .returning(|_, _| Err(ArtworkError::internal("connection refused")));
        let h = harness(Arc::new(repo));

        let subject = ArtworkSubject::new(3, Some("https://x/a.jpg".into()));
        let url = h.resolver.resolve(&subject, "medium", Some("/fallback.png")).await;
        assert_eq!(url, "/fallback.png");

        let stats = h.resolver.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.fallback_used, 1);
        assert_eq!(h.scheduler.status().queued, 0);
    }
}
