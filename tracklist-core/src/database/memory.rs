//! In-process adapters for the persistence ports.
//!
//! Used when no database URL is configured and throughout the test suites.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::Result;
use crate::artwork::{ArtworkSubject, CacheEntry, EntityId, SizeVariant};
use crate::database::ports::albums::AlbumStore;
use crate::database::ports::cache_entries::CacheEntryRepository;

/// Cache index kept in a map, for local runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryCacheEntryRepository {
    rows: RwLock<HashMap<Uuid, CacheEntry>>,
}

impl InMemoryCacheEntryRepository {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert_locked(
        rows: &mut HashMap<Uuid, CacheEntry>,
        mut entry: CacheEntry,
    ) -> CacheEntry {
        let existing = rows
            .values()
            .find(|row| {
                row.cache_key == entry.cache_key
                    && row.size_variant == entry.size_variant
            })
            .cloned();

        if let Some(existing) = existing {
            rows.remove(&existing.id);
            entry.id = existing.id;
            entry.access_count = existing.access_count;
            entry.last_accessed_at =
                entry.last_accessed_at.max(existing.last_accessed_at);
        }

        rows.insert(entry.id, entry.clone());
        entry
    }
}

fn sort_by_access(rows: &mut [CacheEntry]) {
    rows.sort_by(|a, b| {
        a.last_accessed_at
            .cmp(&b.last_accessed_at)
            .then(a.id.cmp(&b.id))
    });
}

#[async_trait]
impl CacheEntryRepository for InMemoryCacheEntryRepository {
    async fn upsert(&self, entry: CacheEntry) -> Result<CacheEntry> {
        let mut rows = self.rows.write().await;
        Ok(Self::upsert_locked(&mut rows, entry))
    }

    async fn upsert_many(&self, entries: Vec<CacheEntry>) -> Result<Vec<CacheEntry>> {
        let mut rows = self.rows.write().await;
        Ok(entries
            .into_iter()
            .map(|entry| Self::upsert_locked(&mut rows, entry))
            .collect())
    }

    async fn find_variant(
        &self,
        entity_id: EntityId,
        variant: SizeVariant,
    ) -> Result<Option<CacheEntry>> {
        let rows = self.rows.read().await;
        let mut matches: Vec<&CacheEntry> = rows
            .values()
            .filter(|row| row.entity_id == entity_id && row.size_variant == variant)
            .collect();
        // Prefer rows that point at a file, then the freshest fetch
        matches.sort_by(|a, b| {
            b.file_path
                .is_some()
                .cmp(&a.file_path.is_some())
                .then(b.last_fetched_at.cmp(&a.last_fetched_at))
        });
        Ok(matches.first().map(|row| (*row).clone()))
    }

    async fn list_for_entity(&self, entity_id: EntityId) -> Result<Vec<CacheEntry>> {
        let rows = self.rows.read().await;
        let mut found: Vec<CacheEntry> = rows
            .values()
            .filter(|row| row.entity_id == entity_id)
            .cloned()
            .collect();
        found.sort_by_key(|row| row.size_variant);
        Ok(found)
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(&id) {
            row.last_accessed_at = row.last_accessed_at.max(at);
            row.access_count += 1;
        }
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<u64> {
        let mut rows = self.rows.write().await;
        Ok(ids.iter().filter(|id| rows.remove(*id).is_some()).count() as u64)
    }

    async fn delete_for_entity(&self, entity_id: EntityId) -> Result<u64> {
        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|_, row| row.entity_id != entity_id);
        Ok((before - rows.len()) as u64)
    }

    async fn all(&self) -> Result<Vec<CacheEntry>> {
        let mut rows: Vec<CacheEntry> =
            self.rows.read().await.values().cloned().collect();
        sort_by_access(&mut rows);
        Ok(rows)
    }

    async fn with_files(&self, limit: Option<usize>) -> Result<Vec<CacheEntry>> {
        let mut rows: Vec<CacheEntry> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.file_path.is_some())
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.last_fetched_at
                .cmp(&b.last_fetched_at)
                .then(a.id.cmp(&b.id))
        });
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn sample_with_files(&self, size: usize) -> Result<Vec<CacheEntry>> {
        let rows = self.rows.read().await;
        let candidates: Vec<&CacheEntry> =
            rows.values().filter(|row| row.file_path.is_some()).collect();
        let mut rng = rand::rng();
        Ok(candidates
            .choose_multiple(&mut rng, size)
            .map(|row| (*row).clone())
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.rows.read().await.len() as u64)
    }

    async fn stale_candidates(
        &self,
        accessed_before: DateTime<Utc>,
        fetched_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let mut rows: Vec<CacheEntry> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| {
                row.last_accessed_at < accessed_before
                    && row.last_fetched_at < fetched_before
            })
            .cloned()
            .collect();
        sort_by_access(&mut rows);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn least_recently_accessed(&self) -> Result<Vec<CacheEntry>> {
        let mut rows: Vec<CacheEntry> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.file_path.is_some())
            .cloned()
            .collect();
        sort_by_access(&mut rows);
        Ok(rows)
    }

    async fn total_bytes(&self) -> Result<u64> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.file_path.is_some())
            .map(CacheEntry::byte_size_or_zero)
            .sum())
    }
}

/// Album store kept in a map.
#[derive(Debug, Default)]
pub struct InMemoryAlbumStore {
    albums: RwLock<HashMap<EntityId, ArtworkSubject>>,
}

impl InMemoryAlbumStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces an album.
    pub async fn insert(&self, album: ArtworkSubject) {
        self.albums.write().await.insert(album.id, album);
    }
}

#[async_trait]
impl AlbumStore for InMemoryAlbumStore {
    async fn get_by_id(&self, id: EntityId) -> Result<Option<ArtworkSubject>> {
        Ok(self.albums.read().await.get(&id).cloned())
    }

    async fn mark_artwork_cached(&self, id: EntityId) -> Result<()> {
        if let Some(album) = self.albums.write().await.get_mut(&id) {
            album.artwork_cached = true;
        }
        Ok(())
    }

    async fn clear_artwork_cached(&self, id: EntityId) -> Result<()> {
        if let Some(album) = self.albums.write().await.get_mut(&id) {
            album.artwork_cached = false;
        }
        Ok(())
    }

    async fn list_cached(&self, limit: Option<usize>) -> Result<Vec<ArtworkSubject>> {
        let albums = self.albums.read().await;
        let mut cached: Vec<ArtworkSubject> = albums
            .values()
            .filter(|album| album.artwork_cached)
            .cloned()
            .collect();
        cached.sort_by_key(|album| album.id);
        if let Some(limit) = limit {
            cached.truncate(limit);
        }
        Ok(cached)
    }

    async fn list_missing_artwork(&self, limit: usize) -> Result<Vec<ArtworkSubject>> {
        let albums = self.albums.read().await;
        let mut missing: Vec<ArtworkSubject> = albums
            .values()
            .filter(|album| !album.artwork_cached && album.origin().is_some())
            .cloned()
            .collect();
        missing.sort_by_key(|album| album.id);
        missing.truncate(limit);
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::path::PathBuf;

    fn entry(entity_id: EntityId, variant: SizeVariant, now: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(entity_id, "https://x/a.jpg", "key", variant, now)
            .with_file(PathBuf::from(format!("/cache/{variant}/key.jpg")), 10)
    }

    #[tokio::test]
    async fn upsert_keeps_identity_and_counters() {
        let repo = InMemoryCacheEntryRepository::new();
        let now = Utc::now();
        let first = repo.upsert(entry(1, SizeVariant::Large, now)).await.unwrap();
        repo.touch(first.id, now + Duration::minutes(5)).await.unwrap();

        let replaced = repo
            .upsert(entry(1, SizeVariant::Large, now + Duration::minutes(1)))
            .await
            .unwrap();
        assert_eq!(replaced.id, first.id);
        assert_eq!(replaced.access_count, 1);
        assert_eq!(replaced.last_accessed_at, now + Duration::minutes(5));
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn touch_never_moves_access_backwards() {
        let repo = InMemoryCacheEntryRepository::new();
        let now = Utc::now();
        let row = repo.upsert(entry(1, SizeVariant::Small, now)).await.unwrap();
        repo.touch(row.id, now - Duration::days(1)).await.unwrap();

        let stored = repo.find_variant(1, SizeVariant::Small).await.unwrap().unwrap();
        assert_eq!(stored.last_accessed_at, now);
        assert_eq!(stored.access_count, 1);
    }

    #[tokio::test]
    async fn stale_candidates_apply_both_cutoffs() {
        let repo = InMemoryCacheEntryRepository::new();
        let now = Utc::now();
        let mut old = entry(1, SizeVariant::Small, now - Duration::days(400));
        old.cache_key = "old".into();
        let mut fresh_fetch = entry(2, SizeVariant::Small, now - Duration::days(400));
        fresh_fetch.cache_key = "fresh".into();
        fresh_fetch.last_fetched_at = now - Duration::days(1);
        repo.upsert_many(vec![old, fresh_fetch]).await.unwrap();

        let stale = repo
            .stale_candidates(now - Duration::days(365), now - Duration::days(7), 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].entity_id, 1);
    }

    #[tokio::test]
    async fn album_store_lists_missing_artwork() {
        let store = InMemoryAlbumStore::new();
        store
            .insert(ArtworkSubject::new(1, Some("https://x/1.jpg".into())))
            .await;
        store.insert(ArtworkSubject::new(2, None)).await;
        store
            .insert(ArtworkSubject::new(3, Some("https://x/3.jpg".into())))
            .await;
        store.mark_artwork_cached(3).await.unwrap();

        let missing = store.list_missing_artwork(10).await.unwrap();
        assert_eq!(missing.iter().map(|a| a.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(store.list_cached(None).await.unwrap().len(), 1);
    }
}
