//! Postgres adapters for the persistence ports.

pub mod albums;
pub mod cache_entries;

pub use albums::PostgresAlbumStore;
pub use cache_entries::PostgresCacheEntryRepository;
