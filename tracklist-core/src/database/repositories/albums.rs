//! Postgres [`AlbumStore`](crate::database::ports::albums::AlbumStore).

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};

use crate::{
    artwork::{ArtworkSubject, EntityId},
    database::ports::albums::AlbumStore,
    error::{ArtworkError, Result},
};

#[derive(Debug, FromRow)]
struct AlbumArtworkRow {
    id: i64,
    cover_art_url: Option<String>,
    artwork_cached: bool,
}

impl From<AlbumArtworkRow> for ArtworkSubject {
    fn from(row: AlbumArtworkRow) -> Self {
        ArtworkSubject {
            id: row.id,
            origin_url: row.cover_art_url,
            artwork_cached: row.artwork_cached,
        }
    }
}

/// Reads and flags albums in the catalogue's `albums` table. The table itself
/// is owned and migrated by the catalogue.
#[derive(Clone, Debug)]
pub struct PostgresAlbumStore {
    pool: PgPool,
}

impl PostgresAlbumStore {
    /// Uses `pool` for every query.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn set_cached(&self, id: EntityId, cached: bool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE albums
            SET artwork_cached = $2,
                artwork_cache_date = CASE WHEN $2 THEN NOW() ELSE NULL END
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(cached)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            ArtworkError::Internal(format!("Failed to update album cache flag: {e}"))
        })?;
        Ok(())
    }
}

#[async_trait]
impl AlbumStore for PostgresAlbumStore {
    async fn get_by_id(&self, id: EntityId) -> Result<Option<ArtworkSubject>> {
        let row: Option<AlbumArtworkRow> = sqlx::query_as(
            r#"
            SELECT id, cover_art_url, COALESCE(artwork_cached, FALSE) AS artwork_cached
            FROM albums
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ArtworkError::Internal(format!("Failed to get album: {e}")))?;

        Ok(row.map(Into::into))
    }

    async fn mark_artwork_cached(&self, id: EntityId) -> Result<()> {
        self.set_cached(id, true).await
    }

    async fn clear_artwork_cached(&self, id: EntityId) -> Result<()> {
        self.set_cached(id, false).await
    }

    async fn list_cached(&self, limit: Option<usize>) -> Result<Vec<ArtworkSubject>> {
        let rows: Vec<AlbumArtworkRow> = sqlx::query_as(
            r#"
            SELECT id, cover_art_url, artwork_cached
            FROM albums
            WHERE artwork_cached = TRUE
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            ArtworkError::Internal(format!("Failed to list cached albums: {e}"))
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_missing_artwork(&self, limit: usize) -> Result<Vec<ArtworkSubject>> {
        let rows: Vec<AlbumArtworkRow> = sqlx::query_as(
            r#"
            SELECT id, cover_art_url, COALESCE(artwork_cached, FALSE) AS artwork_cached
            FROM albums
            WHERE cover_art_url IS NOT NULL
              AND cover_art_url <> ''
              AND COALESCE(artwork_cached, FALSE) = FALSE
            ORDER BY id
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            ArtworkError::Internal(format!("Failed to list uncached albums: {e}"))
        })?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
