//! # Tracklist Core
//!
//! Album artwork caching for the Tracklist server.
//!
//! ## Overview
//!
//! Artwork is served from three tiers, fastest first:
//!
//! - **Memory**: [`memory_cache::ArtworkMemoryCache`], a bounded LRU of resolved URLs with a TTL
//! - **Disk**: resized variants under [`file_cache::CacheLayout`], indexed by
//!   [`database::ports::cache_entries::CacheEntryRepository`] rows
//! - **Origin**: the remote cover URL, returned immediately while a background
//!   [`fetch::FetchTrigger`] job downloads and caches it
//!
//! Maintenance runs on the same [`scheduler::BackgroundScheduler`]:
//! [`cleanup::CleanupEngine`] enforces retention and size budgets,
//! [`integrity::IntegrityChecker`] reconciles the index with the filesystem and
//! [`scheduled::ScheduledTaskRunner`] fires both on a timetable. Manual
//! refreshes go through [`rate_limit::ArtworkRefreshLimiter`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tracklist_core::{
//!     clock::{SharedClock, SystemClock},
//!     memory_cache::{ArtworkMemoryCache, MemoryCacheConfig},
//!     SizeVariant,
//! };
//!
//! let clock: SharedClock = Arc::new(SystemClock);
//! let memory = ArtworkMemoryCache::new(MemoryCacheConfig::default(), clock);
//! memory.set(42, SizeVariant::Medium, "/static/artwork_cache/medium/abc.jpg", None);
//! assert!(memory.get(42, SizeVariant::Medium).is_some());
//! ```

pub mod artwork;
pub mod cleanup;
pub mod clock;
pub mod database;
pub mod error;
pub mod fetch;
pub mod file_cache;
pub mod integrity;
pub mod memory_cache;
pub mod rate_limit;
pub mod refresh;
pub mod reports;
pub mod resolver;
pub mod scheduled;
pub mod scheduler;

pub use artwork::{ArtworkSubject, CacheEntry, EntityId, SizeVariant};
pub use error::{ArtworkError, Result};
