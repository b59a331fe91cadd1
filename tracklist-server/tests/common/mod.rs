#![allow(dead_code)]

use async_trait::async_trait;
use axum_test::TestServer;
use std::sync::Arc;
use tempfile::TempDir;
use tracklist_core::clock::{SharedClock, SystemClock};
use tracklist_core::database::memory::{InMemoryAlbumStore, InMemoryCacheEntryRepository};
use tracklist_core::fetch::processor::sample_png;
use tracklist_core::fetch::{FetchedImage, OriginFetcher};
use tracklist_core::{ArtworkError, ArtworkSubject, EntityId, Result};
use tracklist_server::infra::app_state::{AppState, Backends};
use tracklist_server::infra::config::Config;
use tracklist_server::create_app;

pub const ORIGIN: &str = "https://img.example/a.jpg";

/// Serves a PNG for every URL except those containing `missing`.
#[derive(Debug, Default)]
pub struct FakeOrigin;

#[async_trait]
impl OriginFetcher for FakeOrigin {
    async fn fetch(&self, url: &str) -> Result<FetchedImage> {
        if url.contains("missing") {
            return Err(ArtworkError::Fetch(format!("HTTP 404 for {url}")));
        }
        Ok(FetchedImage {
            bytes: sample_png(300, 300),
            content_type: "image/png".to_string(),
            etag: None,
        })
    }
}

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub albums: Arc<InMemoryAlbumStore>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn album(&self, id: EntityId, origin: Option<&str>) {
        self.albums
            .insert(ArtworkSubject::new(id, origin.map(str::to_string)))
            .await;
    }
}

/// App over in-memory stores with the background scheduler running and the
/// scheduled loop left idle.
pub async fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.cache.root = dir.path().join("artwork_cache");
    config.cache.reports_dir = dir.path().join("logs");

    let albums = Arc::new(InMemoryAlbumStore::new());
    let backends = Backends {
        albums: albums.clone(),
        entries: Arc::new(InMemoryCacheEntryRepository::new()),
        fetcher: Arc::new(FakeOrigin),
    };
    let clock: SharedClock = Arc::new(SystemClock);
    let state = AppState::assemble(Arc::new(config), backends, clock)
        .await
        .unwrap();
    state.scheduler.start();

    let server = TestServer::new(create_app(state.clone())).unwrap();
    TestApp {
        server,
        state,
        albums,
        _dir: dir,
    }
}
