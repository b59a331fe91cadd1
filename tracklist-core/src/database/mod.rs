//! Persistence for the artwork cache index and the album projection it reads.

pub mod memory;
pub mod ports;
pub mod repositories;

use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::error::{ArtworkError, Result};

/// Migrations for the `artwork_cache` table.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Opens a pool and applies the artwork cache migrations.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| ArtworkError::Internal(format!("Failed to run migrations: {e}")))?;

    info!("artwork cache database ready");
    Ok(pool)
}
