//! Postgres cache index over the `artwork_cache` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::path::PathBuf;
use uuid::Uuid;

use crate::{
    artwork::{CacheEntry, EntityId, SizeVariant},
    database::ports::cache_entries::CacheEntryRepository,
    error::{ArtworkError, Result},
};

const SELECT_COLUMNS: &str = r#"
    SELECT id, album_id, original_url, cache_key, size_variant, file_path,
           width, height, file_size_bytes, content_type, etag,
           last_fetched_at, last_accessed_at, access_count, is_placeholder
    FROM artwork_cache
"#;

#[derive(Debug, FromRow)]
struct CacheEntryRow {
    id: Uuid,
    album_id: i64,
    original_url: String,
    cache_key: String,
    size_variant: String,
    file_path: Option<String>,
    width: Option<i32>,
    height: Option<i32>,
    file_size_bytes: Option<i64>,
    content_type: Option<String>,
    etag: Option<String>,
    last_fetched_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    access_count: i64,
    is_placeholder: bool,
}

impl TryFrom<CacheEntryRow> for CacheEntry {
    type Error = ArtworkError;

    fn try_from(row: CacheEntryRow) -> Result<Self> {
        let size_variant = SizeVariant::parse(&row.size_variant).ok_or_else(|| {
            ArtworkError::Integrity(format!(
                "artwork_cache row {} has unknown size variant {}",
                row.id, row.size_variant
            ))
        })?;

        Ok(CacheEntry {
            id: row.id,
            entity_id: row.album_id,
            original_url: row.original_url,
            cache_key: row.cache_key,
            size_variant,
            file_path: row.file_path.map(PathBuf::from),
            width: row.width.map(|w| w.max(0) as u32),
            height: row.height.map(|h| h.max(0) as u32),
            byte_size: row.file_size_bytes.map(|b| b.max(0) as u64),
            content_type: row.content_type,
            etag: row.etag,
            last_fetched_at: row.last_fetched_at,
            last_accessed_at: row.last_accessed_at,
            access_count: row.access_count.max(0) as u64,
            is_placeholder: row.is_placeholder,
        })
    }
}

fn map_rows(rows: Vec<CacheEntryRow>) -> Result<Vec<CacheEntry>> {
    rows.into_iter().map(CacheEntry::try_from).collect()
}

fn db_error(context: &str) -> impl Fn(sqlx::Error) -> ArtworkError + '_ {
    move |e| ArtworkError::Internal(format!("{context}: {e}"))
}

/// [`CacheEntryRepository`] over `artwork_cache`.
#[derive(Clone, Debug)]
pub struct PostgresCacheEntryRepository {
    pool: PgPool,
}

impl PostgresCacheEntryRepository {
    /// Uses `pool` for every query.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn upsert_with<'e, E>(executor: E, entry: &CacheEntry) -> Result<CacheEntry>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let row: CacheEntryRow = sqlx::query_as(
            r#"
            INSERT INTO artwork_cache (
                id, album_id, original_url, cache_key, size_variant, file_path,
                width, height, file_size_bytes, content_type, etag,
                last_fetched_at, last_accessed_at, access_count, is_placeholder
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (cache_key, size_variant) DO UPDATE SET
                album_id = EXCLUDED.album_id,
                original_url = EXCLUDED.original_url,
                file_path = EXCLUDED.file_path,
                width = EXCLUDED.width,
                height = EXCLUDED.height,
                file_size_bytes = EXCLUDED.file_size_bytes,
                content_type = EXCLUDED.content_type,
                etag = EXCLUDED.etag,
                last_fetched_at = EXCLUDED.last_fetched_at,
                last_accessed_at = GREATEST(
                    artwork_cache.last_accessed_at,
                    EXCLUDED.last_accessed_at
                ),
                is_placeholder = EXCLUDED.is_placeholder
            RETURNING id, album_id, original_url, cache_key, size_variant, file_path,
                      width, height, file_size_bytes, content_type, etag,
                      last_fetched_at, last_accessed_at, access_count, is_placeholder
            "#,
        )
        .bind(entry.id)
        .bind(entry.entity_id)
        .bind(&entry.original_url)
        .bind(&entry.cache_key)
        .bind(entry.size_variant.as_str())
        .bind(
            entry
                .file_path
                .as_ref()
                .map(|path| path.to_string_lossy().into_owned()),
        )
        .bind(entry.width.map(|w| w as i32))
        .bind(entry.height.map(|h| h as i32))
        .bind(entry.byte_size.map(|b| b as i64))
        .bind(&entry.content_type)
        .bind(&entry.etag)
        .bind(entry.last_fetched_at)
        .bind(entry.last_accessed_at)
        .bind(entry.access_count as i64)
        .bind(entry.is_placeholder)
        .fetch_one(executor)
        .await
        .map_err(db_error("Failed to upsert artwork cache entry"))?;

        row.try_into()
    }
}

#[async_trait]
impl CacheEntryRepository for PostgresCacheEntryRepository {
    async fn upsert(&self, entry: CacheEntry) -> Result<CacheEntry> {
        Self::upsert_with(&self.pool, &entry).await
    }

    async fn upsert_many(&self, entries: Vec<CacheEntry>) -> Result<Vec<CacheEntry>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let mut stored = Vec::with_capacity(entries.len());
        for entry in &entries {
            stored.push(Self::upsert_with(&mut *tx, entry).await?);
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit artwork cache entries"))?;
        Ok(stored)
    }

    async fn find_variant(
        &self,
        entity_id: EntityId,
        variant: SizeVariant,
    ) -> Result<Option<CacheEntry>> {
        let row: Option<CacheEntryRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS}
             WHERE album_id = $1 AND size_variant = $2
             ORDER BY (file_path IS NOT NULL) DESC, last_fetched_at DESC
             LIMIT 1"
        ))
        .bind(entity_id)
        .bind(variant.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get artwork cache entry"))?;

        row.map(CacheEntry::try_from).transpose()
    }

    async fn list_for_entity(&self, entity_id: EntityId) -> Result<Vec<CacheEntry>> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE album_id = $1 ORDER BY size_variant"
        ))
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list artwork cache entries"))?;

        map_rows(rows)
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE artwork_cache
            SET last_accessed_at = GREATEST(last_accessed_at, $2),
                access_count = access_count + 1
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to record artwork access"))?;
        Ok(())
    }

    async fn delete(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let res = sqlx::query("DELETE FROM artwork_cache WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to delete artwork cache entries"))?;
        Ok(res.rows_affected())
    }

    async fn delete_for_entity(&self, entity_id: EntityId) -> Result<u64> {
        let res = sqlx::query("DELETE FROM artwork_cache WHERE album_id = $1")
            .bind(entity_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to clear album artwork cache"))?;
        Ok(res.rows_affected())
    }

    async fn all(&self) -> Result<Vec<CacheEntry>> {
        let rows: Vec<CacheEntryRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY last_accessed_at"))
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to list artwork cache"))?;
        map_rows(rows)
    }

    async fn with_files(&self, limit: Option<usize>) -> Result<Vec<CacheEntry>> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS}
             WHERE file_path IS NOT NULL
             ORDER BY last_fetched_at, id
             LIMIT $1"
        ))
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list cached artwork files"))?;
        map_rows(rows)
    }

    async fn sample_with_files(&self, size: usize) -> Result<Vec<CacheEntry>> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS}
             WHERE file_path IS NOT NULL
             ORDER BY random()
             LIMIT $1"
        ))
        .bind(size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to sample artwork cache"))?;
        map_rows(rows)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artwork_cache")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to count artwork cache"))?;
        Ok(count.max(0) as u64)
    }

    async fn stale_candidates(
        &self,
        accessed_before: DateTime<Utc>,
        fetched_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<CacheEntry>> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS}
             WHERE last_accessed_at < $1 AND last_fetched_at < $2
             ORDER BY last_accessed_at, id
             LIMIT $3"
        ))
        .bind(accessed_before)
        .bind(fetched_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to select stale artwork"))?;
        map_rows(rows)
    }

    async fn least_recently_accessed(&self) -> Result<Vec<CacheEntry>> {
        let rows: Vec<CacheEntryRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS}
             WHERE file_path IS NOT NULL
             ORDER BY last_accessed_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to order artwork by access"))?;
        map_rows(rows)
    }

    async fn total_bytes(&self) -> Result<u64> {
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(file_size_bytes), 0)::BIGINT
            FROM artwork_cache
            WHERE file_path IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to sum artwork cache size"))?;
        Ok(total.max(0) as u64)
    }
}
