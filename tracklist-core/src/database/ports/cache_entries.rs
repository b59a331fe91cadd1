//! The cache index port.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::Result;
use crate::artwork::{CacheEntry, EntityId, SizeVariant};

/// Repository port for the artwork cache index.
///
/// Rows are the source of truth for what is cached on disk. Adapters must
/// apply each multi-row mutation atomically.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CacheEntryRepository: Send + Sync {
    /// Insert or replace the row for `(cache_key, size_variant)`. The stored
    /// row keeps its original id and access counters when it already exists.
    async fn upsert(&self, entry: CacheEntry) -> Result<CacheEntry>;
    /// [`CacheEntryRepository::upsert`] for several rows in one transaction.
    async fn upsert_many(&self, entries: Vec<CacheEntry>) -> Result<Vec<CacheEntry>>;

    /// The row for one album and variant.
    async fn find_variant(
        &self,
        entity_id: EntityId,
        variant: SizeVariant,
    ) -> Result<Option<CacheEntry>>;
    /// Every row belonging to an album.
    async fn list_for_entity(&self, entity_id: EntityId) -> Result<Vec<CacheEntry>>;

    /// Record an access: `last_accessed_at` never moves backwards and
    /// `access_count` is incremented.
    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Deletes rows by id and returns how many went.
    async fn delete(&self, ids: &[Uuid]) -> Result<u64>;
    /// Deletes every row of an album and returns how many went.
    async fn delete_for_entity(&self, entity_id: EntityId) -> Result<u64>;

    /// Every row.
    async fn all(&self) -> Result<Vec<CacheEntry>>;
    /// Rows with a non-null file path, oldest first.
    async fn with_files(&self, limit: Option<usize>) -> Result<Vec<CacheEntry>>;
    /// Random sample of rows with a non-null file path.
    async fn sample_with_files(&self, size: usize) -> Result<Vec<CacheEntry>>;
    /// Number of rows.
    async fn count(&self) -> Result<u64>;

    /// Rows last accessed before `accessed_before` and last fetched before
    /// `fetched_before`, least recently accessed first.
    async fn stale_candidates(
        &self,
        accessed_before: DateTime<Utc>,
        fetched_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>>;

    /// Rows with files ordered by `last_accessed_at` ascending.
    async fn least_recently_accessed(&self) -> Result<Vec<CacheEntry>>;

    /// Sum of `file_size` over rows with files.
    async fn total_bytes(&self) -> Result<u64>;
}
