//! Read and flag access to albums.

use async_trait::async_trait;

use crate::Result;
use crate::artwork::{ArtworkSubject, EntityId};

/// Port onto the album store owned by the catalogue side of the application.
/// Only the artwork-related projection of an album crosses this boundary.
#[async_trait]
pub trait AlbumStore: Send + Sync {
    /// The album's artwork projection, if it exists.
    async fn get_by_id(&self, id: EntityId) -> Result<Option<ArtworkSubject>>;
    /// Flags the album as having cached artwork.
    async fn mark_artwork_cached(&self, id: EntityId) -> Result<()>;
    /// Clears the cached flag.
    async fn clear_artwork_cached(&self, id: EntityId) -> Result<()>;

    /// Albums currently flagged as cached.
    async fn list_cached(&self, limit: Option<usize>) -> Result<Vec<ArtworkSubject>>;
    /// Albums with an origin URL that are not flagged as cached.
    async fn list_missing_artwork(&self, limit: usize) -> Result<Vec<ArtworkSubject>>;
}
