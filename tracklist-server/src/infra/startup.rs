use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::infra::app_state::Backends;
use crate::infra::config::Config;
use tracklist_core::database::{
    self,
    memory::{InMemoryAlbumStore, InMemoryCacheEntryRepository},
    repositories::{albums::PostgresAlbumStore, cache_entries::PostgresCacheEntryRepository},
};
use tracklist_core::fetch::HttpOriginFetcher;

/// Opens PostgreSQL when a URL is configured, otherwise falls back to the
/// in-memory stores.
pub async fn open_backends(config: &Config) -> anyhow::Result<Backends> {
    let fetcher = Arc::new(
        HttpOriginFetcher::new(&config.fetch).context("failed to build origin HTTP client")?,
    );

    let Some(url) = config.database.url.as_deref() else {
        warn!("DATABASE_URL not set - artwork index and albums are kept in memory");
        return Ok(Backends {
            albums: Arc::new(InMemoryAlbumStore::new()),
            entries: Arc::new(InMemoryCacheEntryRepository::new()),
            fetcher,
        });
    };

    if !(url.starts_with("postgres://") || url.starts_with("postgresql://")) {
        anyhow::bail!("Invalid database URL: must start with postgres:// or postgresql://");
    }

    let pool = database::connect(url, config.database.max_connections)
        .await
        .context("failed to connect to PostgreSQL")?;
    info!("connected to PostgreSQL");

    Ok(Backends {
        albums: Arc::new(PostgresAlbumStore::new(pool.clone())),
        entries: Arc::new(PostgresCacheEntryRepository::new(pool)),
        fetcher,
    })
}
