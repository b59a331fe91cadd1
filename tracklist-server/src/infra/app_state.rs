use std::{fmt, sync::Arc};

use anyhow::Context;
use tracing::info;

use crate::infra::config::Config;
use tracklist_core::cleanup::CleanupEngine;
use tracklist_core::clock::SharedClock;
use tracklist_core::database::ports::{albums::AlbumStore, cache_entries::CacheEntryRepository};
use tracklist_core::fetch::{ArtworkCacheWorker, FetchTrigger, OriginFetcher};
use tracklist_core::file_cache::CacheLayout;
use tracklist_core::integrity::IntegrityChecker;
use tracklist_core::memory_cache::ArtworkMemoryCache;
use tracklist_core::rate_limit::ArtworkRefreshLimiter;
use tracklist_core::refresh::RefreshService;
use tracklist_core::reports::ReportWriter;
use tracklist_core::resolver::ArtworkResolver;
use tracklist_core::scheduled::{MaintenanceTargets, ScheduledTaskRunner};
use tracklist_core::scheduler::BackgroundScheduler;

/// Persistence and origin adapters the components are built on.
#[derive(Clone)]
pub struct Backends {
    pub albums: Arc<dyn AlbumStore>,
    pub entries: Arc<dyn CacheEntryRepository>,
    pub fetcher: Arc<dyn OriginFetcher>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: SharedClock,
    pub albums: Arc<dyn AlbumStore>,
    pub entries: Arc<dyn CacheEntryRepository>,
    pub layout: Arc<CacheLayout>,
    pub memory: Arc<ArtworkMemoryCache>,
    pub scheduler: BackgroundScheduler,
    pub trigger: Arc<FetchTrigger>,
    pub resolver: Arc<ArtworkResolver>,
    pub refresh: Arc<RefreshService>,
    pub cleanup: Arc<CleanupEngine>,
    pub integrity: Arc<IntegrityChecker>,
    pub runner: ScheduledTaskRunner,
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

impl AppState {
    /// Builds every component. Nothing runs until [`AppState::start`].
    pub async fn assemble(
        config: Arc<Config>,
        backends: Backends,
        clock: SharedClock,
    ) -> anyhow::Result<Self> {
        let Backends {
            albums,
            entries,
            fetcher,
        } = backends;

        let layout = Arc::new(CacheLayout::new(
            config.cache.root.clone(),
            config.cache.web_prefix.clone(),
        ));
        layout
            .ensure_structure()
            .await
            .with_context(|| format!("failed to create cache root {}", layout.root().display()))?;

        let reports = ReportWriter::new(config.cache.reports_dir.clone());
        let memory = Arc::new(ArtworkMemoryCache::new(config.memory_cache, clock.clone()));
        let scheduler = BackgroundScheduler::new(config.scheduler, clock.clone());

        let worker = Arc::new(
            ArtworkCacheWorker::new(
                entries.clone(),
                albums.clone(),
                fetcher,
                layout.clone(),
                memory.clone(),
                clock.clone(),
            )
            .with_fetch_timeout(config.fetch.timeout),
        );
        let trigger = Arc::new(FetchTrigger::new(
            scheduler.clone(),
            worker,
            albums.clone(),
            clock.clone(),
        ));
        let resolver = Arc::new(
            ArtworkResolver::new(
                memory.clone(),
                entries.clone(),
                layout.clone(),
                trigger.clone(),
                clock.clone(),
            )
            .with_placeholder(config.cache.placeholder_url.clone()),
        );
        let limiter = Arc::new(ArtworkRefreshLimiter::new(
            config.rate_limit.hourly_max,
            config.rate_limit.daily_max,
            clock.clone(),
        ));
        let refresh = Arc::new(RefreshService::new(
            limiter,
            albums.clone(),
            entries.clone(),
            layout.clone(),
            memory.clone(),
            trigger.clone(),
        ));
        let cleanup = Arc::new(CleanupEngine::new(
            entries.clone(),
            layout.clone(),
            reports.clone(),
            clock.clone(),
            config.cleanup.clone(),
        ));
        let integrity = Arc::new(
            IntegrityChecker::new(
                entries.clone(),
                albums.clone(),
                layout.clone(),
                reports.clone(),
                clock.clone(),
            )
            .with_grace_days(config.cleanup.recently_added_grace_days),
        );
        let runner = ScheduledTaskRunner::new(
            config.scheduled.clone(),
            scheduler.clone(),
            MaintenanceTargets {
                cleanup: cleanup.clone(),
                integrity: integrity.clone(),
                memory: memory.clone(),
                reports,
            },
            clock.clone(),
        );

        info!(
            cache.root = %layout.root().display(),
            cache.reports = %config.cache.reports_dir.display(),
            scheduler.max_concurrent = config.scheduler.max_concurrent,
            memory_cache.max_entries = config.memory_cache.max_entries,
            "artwork components assembled"
        );

        Ok(Self {
            config,
            clock,
            albums,
            entries,
            layout,
            memory,
            scheduler,
            trigger,
            resolver,
            refresh,
            cleanup,
            integrity,
            runner,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts the background scheduler and the scheduled task loop.
    pub fn start(&self) {
        self.scheduler.start();
        self.runner.start();
    }

    /// Stops the scheduled loop first so nothing new is queued, then lets
    /// running jobs finish.
    pub async fn shutdown(&self) {
        self.runner.stop().await;
        self.scheduler.stop().await;
        info!("artwork components stopped");
    }
}
