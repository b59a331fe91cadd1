use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use super::SizeVariant;

/// Album identifier as stored by the entity store.
pub type EntityId = i64;

/// The caller-side view of an album needed to resolve or cache its artwork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtworkSubject {
    /// Album id.
    pub id: EntityId,
    /// Remote cover URL, if the album has one.
    pub origin_url: Option<String>,
    /// Set once every variant has been written and indexed.
    pub artwork_cached: bool,
}

impl ArtworkSubject {
    /// Uncached subject.
    pub fn new(id: EntityId, origin_url: Option<String>) -> Self {
        Self {
            id,
            origin_url,
            artwork_cached: false,
        }
    }

    /// Origin URL, ignoring blank values.
    pub fn origin(&self) -> Option<&str> {
        self.origin_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// One cached image variant, the persisted source of truth for what is
/// cached on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Row id.
    pub id: Uuid,
    /// Owning album.
    pub entity_id: EntityId,
    /// Origin URL the variant was derived from.
    pub original_url: String,
    /// Truncated SHA-256 of `original_url`; names the file on disk.
    pub cache_key: String,
    /// Which resized derivative this row describes.
    pub size_variant: SizeVariant,
    /// `None` marks a known-missing image.
    pub file_path: Option<PathBuf>,
    /// Pixel width as written.
    pub width: Option<u32>,
    /// Pixel height as written.
    pub height: Option<u32>,
    /// Size on disk when written, compared by integrity checks.
    pub byte_size: Option<u64>,
    /// MIME type of the written file.
    pub content_type: Option<String>,
    /// Origin `ETag`, when the origin sent one.
    pub etag: Option<String>,
    /// When the file was last written from the origin.
    pub last_fetched_at: DateTime<Utc>,
    /// Last resolver hit. Never moves backwards.
    pub last_accessed_at: DateTime<Utc>,
    /// Resolver hits since the row was created.
    pub access_count: u64,
    /// Row stands in for artwork the origin could not supply.
    pub is_placeholder: bool,
}

impl CacheEntry {
    /// Fresh row with no file; timestamps start at `now`.
    pub fn new(
        entity_id: EntityId,
        original_url: impl Into<String>,
        cache_key: impl Into<String>,
        size_variant: SizeVariant,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            original_url: original_url.into(),
            cache_key: cache_key.into(),
            size_variant,
            file_path: None,
            width: None,
            height: None,
            byte_size: None,
            content_type: None,
            etag: None,
            last_fetched_at: now,
            last_accessed_at: now,
            access_count: 0,
            is_placeholder: false,
        }
    }

    /// Points the row at a written file of `byte_size` bytes.
    pub fn with_file(mut self, path: PathBuf, byte_size: u64) -> Self {
        self.file_path = Some(path);
        self.byte_size = Some(byte_size);
        self
    }

    /// Recorded size, treating unknown as zero.
    pub fn byte_size_or_zero(&self) -> u64 {
        self.byte_size.unwrap_or(0)
    }
}
