//! Artwork domain types shared by every cache tier.

mod entry;
mod variant;

pub use entry::{ArtworkSubject, CacheEntry, EntityId};
pub use variant::SizeVariant;
