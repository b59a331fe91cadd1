//! Persistence ports consumed by the cache components. Postgres adapters live
//! in [`crate::database::repositories`], in-memory ones in
//! [`crate::database::memory`].

pub mod albums;
pub mod cache_entries;
