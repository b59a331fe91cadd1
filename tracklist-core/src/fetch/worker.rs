//! Download-once, derive-all-variants worker.
//!
//! Files are always written before their index rows so a resolver can never
//! observe a row pointing at a file that does not exist yet.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::origin::OriginFetcher;
use super::processor::{self, RenderedVariant};
use crate::artwork::{CacheEntry, EntityId, SizeVariant};
use crate::clock::SharedClock;
use crate::database::ports::albums::AlbumStore;
use crate::database::ports::cache_entries::CacheEntryRepository;
use crate::error::{ArtworkError, Result};
use crate::file_cache::{CacheLayout, remove_file_if_exists, write_atomically};
use crate::memory_cache::ArtworkMemoryCache;

/// Skip reason for albums without an origin URL.
pub const NO_ARTWORK_URL: &str = "no_artwork_url";

/// Result of one cache job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheOutcome {
    /// Whether the album now has cached artwork.
    pub success: bool,
    /// Nothing was fetched because every variant was present.
    pub already_cached: bool,
    /// Variants written.
    pub variants: usize,
    /// Key the files were stored under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Why the job was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CacheOutcome {
    fn already_cached() -> Self {
        Self {
            success: true,
            already_cached: true,
            variants: 0,
            cache_key: None,
            reason: None,
        }
    }

    fn skipped(reason: &str) -> Self {
        Self {
            success: false,
            already_cached: false,
            variants: 0,
            cache_key: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Downloads an album's artwork and writes every size variant with its index rows.
pub struct ArtworkCacheWorker {
    entries: Arc<dyn CacheEntryRepository>,
    albums: Arc<dyn AlbumStore>,
    fetcher: Arc<dyn OriginFetcher>,
    layout: Arc<CacheLayout>,
    memory: Arc<ArtworkMemoryCache>,
    clock: SharedClock,
    fetch_timeout: Duration,
}

impl std::fmt::Debug for ArtworkCacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtworkCacheWorker")
            .field("root", &self.layout.root())
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl ArtworkCacheWorker {
    /// Uses a 30 second fetch timeout.
    pub fn new(
        entries: Arc<dyn CacheEntryRepository>,
        albums: Arc<dyn AlbumStore>,
        fetcher: Arc<dyn OriginFetcher>,
        layout: Arc<CacheLayout>,
        memory: Arc<ArtworkMemoryCache>,
        clock: SharedClock,
    ) -> Self {
        Self {
            entries,
            albums,
            fetcher,
            layout,
            memory,
            clock,
            fetch_timeout: Duration::from_secs(30),
        }
    }

    /// Overrides the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Caches every size variant of `origin_url` for the album.
    ///
    /// Albums already flagged as cached are skipped without a download.
    /// Fails when the album is unknown, the origin cannot be fetched or
    /// decoded, or no variant could be written.
    pub async fn cache(&self, entity_id: EntityId, origin_url: &str) -> Result<CacheOutcome> {
        let album = self
            .albums
            .get_by_id(entity_id)
            .await?
            .ok_or_else(|| ArtworkError::not_found(format!("Album {entity_id} not found")))?;

        if album.artwork_cached {
            debug!(entity_id, "artwork already cached");
            return Ok(CacheOutcome::already_cached());
        }

        let origin_url = origin_url.trim();
        if origin_url.is_empty() {
            return Ok(CacheOutcome::skipped(NO_ARTWORK_URL));
        }

        let fetched = tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(origin_url))
            .await
            .map_err(|_| {
                ArtworkError::Fetch(format!(
                    "Timed out after {}s fetching {origin_url}",
                    self.fetch_timeout.as_secs()
                ))
            })??;

        let rendered =
            processor::render_all_blocking(fetched.bytes, SizeVariant::ALL.to_vec()).await?;

        let cache_key = CacheLayout::generate_cache_key(origin_url);
        self.layout.ensure_structure().await?;

        let mut written: Vec<(RenderedVariant, PathBuf)> = Vec::with_capacity(rendered.len());
        for variant in rendered {
            let path = self.layout.path_for(
                &cache_key,
                variant.variant,
                Some(processor::OUTPUT_EXTENSION),
            );
            match write_atomically(&path, &variant.bytes).await {
                Ok(()) => written.push((variant, path)),
                Err(e) => warn!(
                    entity_id,
                    variant = %variant.variant,
                    "failed to write artwork variant: {e}"
                ),
            }
        }

        if written.is_empty() {
            return Err(ArtworkError::Internal(format!(
                "No artwork variants could be written for album {entity_id}"
            )));
        }

        let now = self.clock.now();
        let rows: Vec<CacheEntry> = written
            .iter()
            .map(|(variant, path)| {
                let mut entry =
                    CacheEntry::new(entity_id, origin_url, &cache_key, variant.variant, now)
                        .with_file(path.clone(), variant.bytes.len() as u64);
                entry.width = Some(variant.width);
                entry.height = Some(variant.height);
                entry.content_type = Some(processor::OUTPUT_CONTENT_TYPE.to_string());
                entry.etag = fetched.etag.clone();
                entry
            })
            .collect();

        if let Err(e) = self.entries.upsert_many(rows).await {
            for (_, path) in &written {
                if let Err(cleanup) = remove_file_if_exists(path).await {
                    warn!(path = %path.display(), "failed to remove unindexed variant: {cleanup}");
                }
            }
            return Err(e);
        }

        self.albums.mark_artwork_cached(entity_id).await?;
        self.memory.invalidate(entity_id, None);

        info!(entity_id, variants = written.len(), cache_key = %cache_key, "cached album artwork");
        Ok(CacheOutcome {
            success: true,
            already_cached: false,
            variants: written.len(),
            cache_key: Some(cache_key),
            reason: None,
        })
    }
}

/// Writes to a sibling temp file then renames it into place.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::artwork::ArtworkSubject;
    use crate::clock::SystemClock;
    use crate::database::memory::{InMemoryAlbumStore, InMemoryCacheEntryRepository};
    use crate::fetch::origin::FetchedImage;
    use crate::memory_cache::MemoryCacheConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct StaticFetcher {
        body: Option<Vec<u8>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OriginFetcher for StaticFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.body {
                Some(bytes) => Ok(FetchedImage {
                    bytes: bytes.clone(),
                    content_type: "image/png".into(),
                    etag: Some("\"v1\"".into()),
                }),
                None => Err(ArtworkError::Fetch(format!("HTTP 404 for {url}"))),
            }
        }
    }

    struct Fixture {
        _dir: TempDir,
        worker: ArtworkCacheWorker,
        entries: Arc<InMemoryCacheEntryRepository>,
        albums: Arc<InMemoryAlbumStore>,
        memory: Arc<ArtworkMemoryCache>,
        fetcher: Arc<StaticFetcher>,
    }

    async fn fixture(body: Option<Vec<u8>>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock: SharedClock = Arc::new(SystemClock);
        let entries = Arc::new(InMemoryCacheEntryRepository::new());
        let albums = Arc::new(InMemoryAlbumStore::new());
        let memory = Arc::new(ArtworkMemoryCache::new(
            MemoryCacheConfig::default(),
            clock.clone(),
        ));
        let fetcher = Arc::new(StaticFetcher {
            body,
            calls: AtomicUsize::new(0),
        });
        let layout = Arc::new(CacheLayout::new(dir.path(), "/static/artwork_cache"));
        albums
            .insert(ArtworkSubject::new(1, Some("https://x/a.jpg".into())))
            .await;

        let worker = ArtworkCacheWorker::new(
            entries.clone(),
            albums.clone(),
            fetcher.clone(),
            layout,
            memory.clone(),
            clock,
        );
        Fixture {
            _dir: dir,
            worker,
            entries,
            albums,
            memory,
            fetcher,
        }
    }

    #[tokio::test]
    async fn caches_all_variants_then_short_circuits() {
        let fx = fixture(Some(processor::sample_png(120, 90))).await;
        fx.memory.set(1, SizeVariant::Medium, "https://x/a.jpg", None);

        let outcome = fx.worker.cache(1, "https://x/a.jpg").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.variants, 5);

        let rows = fx.entries.list_for_entity(1).await.unwrap();
        assert_eq!(rows.len(), 5);
        for row in &rows {
            let path = row.file_path.as_ref().unwrap();
            assert!(crate::file_cache::file_exists(path).await);
            assert_eq!(row.etag.as_deref(), Some("\"v1\""));
        }
        assert!(fx.albums.get_by_id(1).await.unwrap().unwrap().artwork_cached);
        assert!(fx.memory.get(1, SizeVariant::Medium).is_none());

        let again = fx.worker.cache(1, "https://x/a.jpg").await.unwrap();
        assert!(again.already_cached);
        assert_eq!(fx.fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_failure_leaves_no_rows() {
        let fx = fixture(None).await;
        let err = fx.worker.cache(1, "https://x/a.jpg").await.unwrap_err();
        assert_eq!(err.kind(), "fetch");
        assert_eq!(fx.entries.count().await.unwrap(), 0);
        assert!(!fx.albums.get_by_id(1).await.unwrap().unwrap().artwork_cached);
    }

    #[tokio::test]
    async fn blank_url_and_unknown_album() {
        let fx = fixture(None).await;
        let outcome = fx.worker.cache(1, "  ").await.unwrap();
        assert_eq!(outcome.reason.as_deref(), Some(NO_ARTWORK_URL));
        assert!(!outcome.success);

        let err = fx.worker.cache(99, "https://x/a.jpg").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
