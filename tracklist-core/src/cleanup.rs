//! Retention and consistency cleanup for the artwork cache.
//!
//! A run makes four ordered passes: age-based eviction, orphaned files,
//! invalid records and the optional size budget. In dry-run mode nothing is
//! removed, but later passes see the earlier passes' simulated deletions so
//! the reported counts match a real run on the same data.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artwork::CacheEntry;
use crate::clock::SharedClock;
use crate::database::ports::cache_entries::CacheEntryRepository;
use crate::error::Result;
use crate::file_cache::{CacheLayout, file_exists, remove_file_if_exists};
use crate::reports::{CLEANUP_REPORTS, ReportWriter};

const BYTES_PER_MB: u64 = 1024 * 1024;
const RECENT_ACCESS_DAYS: i64 = 30;

/// Retention policy and limits for a cleanup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Entries unaccessed for this long are evicted.
    pub default_retention_days: u32,
    /// Entries accessed more recently than this are never evicted.
    pub minimum_retention_days: u32,
    /// Entries fetched and files written more recently than this are exempt.
    pub recently_added_grace_days: u32,
    /// Disk budget; when exceeded, least recently accessed entries go first.
    pub max_cache_size_mb: Option<u64>,
    /// Defaults to 80% of `max_cache_size_mb`.
    pub target_size_mb: Option<u64>,
    /// Report what would be removed without removing it.
    pub dry_run: bool,
    /// Remove files that no index row points at.
    pub delete_orphaned_files: bool,
    /// Remove index rows whose file is gone.
    pub delete_invalid_records: bool,
    /// Index rows deleted per repository call.
    pub batch_size: usize,
    /// Upper bound on files plus rows removed in one run.
    pub max_deletions_per_run: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            default_retention_days: 365,
            minimum_retention_days: 30,
            recently_added_grace_days: 7,
            max_cache_size_mb: None,
            target_size_mb: None,
            dry_run: false,
            delete_orphaned_files: true,
            delete_invalid_records: true,
            batch_size: 100,
            max_deletions_per_run: 1000,
        }
    }
}

/// Report for one cleanup invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupRun {
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub completed_at: DateTime<Utc>,
    /// Wall time in seconds.
    pub duration_seconds: f64,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// False when the run stopped early at the deletion cap.
    pub complete: bool,
    /// Retention applied.
    pub retention_days: u32,
    /// Files seen under the cache root.
    pub files_scanned: u64,
    /// Files removed (or that would be, on a dry run).
    pub files_deleted: u64,
    /// Bytes reclaimed.
    pub bytes_freed: u64,
    /// Index rows examined.
    pub records_scanned: u64,
    /// Index rows removed.
    pub records_deleted: u64,
    /// Files without an index row.
    pub orphaned_files: u64,
    /// Rows without a file.
    pub invalid_records: u64,
    /// Entries evicted to get under the disk budget.
    pub size_evictions: u64,
    /// Non-fatal errors encountered along the way.
    pub errors: Vec<String>,
    /// Where the JSON report was written, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl CleanupRun {
    fn new(started_at: DateTime<Utc>, config: &CleanupConfig) -> Self {
        Self {
            started_at,
            completed_at: started_at,
            duration_seconds: 0.0,
            dry_run: config.dry_run,
            complete: false,
            retention_days: config.default_retention_days,
            files_scanned: 0,
            files_deleted: 0,
            bytes_freed: 0,
            records_scanned: 0,
            records_deleted: 0,
            orphaned_files: 0,
            invalid_records: 0,
            size_evictions: 0,
            errors: Vec::new(),
            report_path: None,
        }
    }

    /// `bytes_freed` in megabytes.
    pub fn mb_freed(&self) -> f64 {
        self.bytes_freed as f64 / BYTES_PER_MB as f64
    }
}

/// Estimate of what a cleanup would reclaim right now.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupStatus {
    /// Rows in the cache index.
    pub total_entries: u64,
    /// Rows past retention.
    pub old_entries: u64,
    /// Rows accessed in the last 30 days.
    pub recent_entries: u64,
    /// Current size on disk.
    pub cache_size_mb: f64,
    /// Retention used for the estimate.
    pub retention_days: u32,
    /// Set once old entries are worth a run.
    pub recommended_cleanup: bool,
    /// Approximate space a run would reclaim.
    pub estimated_space_to_free_mb: f64,
}

/// Mutable bookkeeping for a single run.
struct RunState {
    run: CleanupRun,
    dry_run: bool,
    batch_size: usize,
    pending: Vec<Uuid>,
    removed_ids: HashSet<Uuid>,
    removed_paths: HashSet<PathBuf>,
}

impl RunState {
    fn is_removed(&self, entry: &CacheEntry) -> bool {
        self.removed_ids.contains(&entry.id)
    }

    fn record_error(&mut self, message: String) {
        warn!("{message}");
        self.run.errors.push(message);
    }
}

/// Retention cleanup over the cache index and the files on disk.
pub struct CleanupEngine {
    entries: Arc<dyn CacheEntryRepository>,
    layout: Arc<CacheLayout>,
    reports: ReportWriter,
    clock: SharedClock,
    defaults: CleanupConfig,
    run_lock: Mutex<()>,
}

impl std::fmt::Debug for CleanupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupEngine")
            .field("root", &self.layout.root())
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}

impl CleanupEngine {
    /// `defaults` applies to runs that do not pass their own config.
    pub fn new(
        entries: Arc<dyn CacheEntryRepository>,
        layout: Arc<CacheLayout>,
        reports: ReportWriter,
        clock: SharedClock,
        defaults: CleanupConfig,
    ) -> Self {
        Self {
            entries,
            layout,
            reports,
            clock,
            defaults,
            run_lock: Mutex::new(()),
        }
    }

    /// Configuration used when callers do not supply their own.
    pub fn defaults(&self) -> &CleanupConfig {
        &self.defaults
    }

    /// Runs all enabled passes and saves the report.
    ///
    /// A failing pass is recorded in `errors` and the remaining passes still
    /// run. Only an unreachable index aborts the run; the partial report is
    /// still saved, marked incomplete.
    pub async fn cleanup(&self, config: CleanupConfig) -> Result<CleanupRun> {
        let _guard = self.run_lock.lock().await;
        let timer = Instant::now();
        let now = self.clock.now();

        info!(
            retention_days = config.default_retention_days,
            dry_run = config.dry_run,
            "starting cache cleanup"
        );

        let mut state = RunState {
            run: CleanupRun::new(now, &config),
            dry_run: config.dry_run,
            batch_size: config.batch_size.max(1),
            pending: Vec::new(),
            removed_ids: HashSet::new(),
            removed_paths: HashSet::new(),
        };

        if let Err(e) = self.entries.count().await {
            error!("cache cleanup aborted, index unavailable: {e}");
            state.run.errors.push(format!("Index unavailable: {e}"));
            self.finish(&mut state, timer).await;
            return Err(e);
        }

        if let Err(e) = self.age_pass(&config, now, &mut state).await {
            state.record_error(format!("Old entries cleanup error: {e}"));
        }
        if config.delete_orphaned_files
            && let Err(e) = self.orphan_pass(&config, now, &mut state).await
        {
            state.record_error(format!("Orphaned files cleanup error: {e}"));
        }
        if config.delete_invalid_records
            && let Err(e) = self.invalid_record_pass(&mut state).await
        {
            state.record_error(format!("Invalid records cleanup error: {e}"));
        }
        if config.max_cache_size_mb.is_some()
            && let Err(e) = self.size_pass(&config, now, &mut state).await
        {
            state.record_error(format!("Size limit enforcement error: {e}"));
        }

        state.run.complete = true;
        self.finish(&mut state, timer).await;

        let run = state.run;
        info!(
            files_scanned = run.files_scanned,
            files_deleted = run.files_deleted,
            records_deleted = run.records_deleted,
            orphaned_files = run.orphaned_files,
            invalid_records = run.invalid_records,
            mb_freed = run.mb_freed(),
            errors = run.errors.len(),
            dry_run = run.dry_run,
            "cache cleanup finished"
        );
        Ok(run)
    }

    async fn finish(&self, state: &mut RunState, timer: Instant) {
        state.run.completed_at = self.clock.now();
        state.run.duration_seconds = timer.elapsed().as_secs_f64();
        match self
            .reports
            .write(Some(CLEANUP_REPORTS), "cleanup", state.run.completed_at, &state.run)
            .await
        {
            Ok(path) => state.run.report_path = Some(path),
            Err(e) => state.record_error(format!("Failed to save cleanup report: {e}")),
        }
    }

    /// Pass 1: entries unaccessed past retention, outside the grace period.
    async fn age_pass(
        &self,
        config: &CleanupConfig,
        now: DateTime<Utc>,
        state: &mut RunState,
    ) -> Result<()> {
        let retention = config
            .default_retention_days
            .max(config.minimum_retention_days);
        let accessed_before = now - Duration::days(i64::from(retention));
        let fetched_before = now - Duration::days(i64::from(config.recently_added_grace_days));

        let candidates = self
            .entries
            .stale_candidates(accessed_before, fetched_before, config.max_deletions_per_run)
            .await?;
        debug!(candidates = candidates.len(), "age pass candidates");

        let mut evicted = 0u64;
        for entry in candidates {
            state.run.records_scanned += 1;
            if self.evict(&entry, state).await? {
                evicted += 1;
            }
        }
        self.flush(state).await?;

        info!(evicted, "age pass finished");
        Ok(())
    }

    /// Pass 2: files on disk no row references, older than the grace period.
    async fn orphan_pass(
        &self,
        config: &CleanupConfig,
        now: DateTime<Utc>,
        state: &mut RunState,
    ) -> Result<()> {
        let referenced: HashSet<PathBuf> = self
            .entries
            .with_files(None)
            .await?
            .into_iter()
            .filter(|entry| !state.is_removed(entry))
            .filter_map(|entry| entry.file_path)
            .collect();
        let grace = Duration::days(i64::from(config.recently_added_grace_days));

        for file in self.layout.list_files().await? {
            if state.removed_paths.contains(&file.path) {
                continue;
            }
            state.run.files_scanned += 1;
            if referenced.contains(&file.path) {
                continue;
            }
            if now - file.modified <= grace {
                debug!(path = %file.path.display(), "orphan within grace period");
                continue;
            }

            if !state.dry_run
                && let Err(e) = remove_file_if_exists(&file.path).await
            {
                state.record_error(format!(
                    "Orphaned file deletion error for {}: {e}",
                    file.path.display()
                ));
                continue;
            }
            debug!(path = %file.path.display(), dry_run = state.dry_run, "orphaned file removed");
            state.run.orphaned_files += 1;
            state.run.files_deleted += 1;
            state.run.bytes_freed += file.size;
            state.removed_paths.insert(file.path);
        }

        info!(orphaned = state.run.orphaned_files, "orphan pass finished");
        Ok(())
    }

    /// Pass 3: rows whose file is gone.
    async fn invalid_record_pass(&self, state: &mut RunState) -> Result<()> {
        let rows = self.entries.with_files(None).await?;
        for entry in rows {
            if state.is_removed(&entry) {
                continue;
            }
            state.run.records_scanned += 1;
            let Some(path) = &entry.file_path else {
                continue;
            };
            if !state.removed_paths.contains(path) && file_exists(path).await {
                continue;
            }

            debug!(entry_id = %entry.id, path = %path.display(), "invalid cache record");
            state.run.invalid_records += 1;
            self.queue_row(entry.id, state).await?;
        }
        self.flush(state).await?;

        info!(invalid = state.run.invalid_records, "invalid record pass finished");
        Ok(())
    }

    /// Pass 4: least recently accessed entries until the cache is back under
    /// its target size.
    async fn size_pass(
        &self,
        config: &CleanupConfig,
        now: DateTime<Utc>,
        state: &mut RunState,
    ) -> Result<()> {
        let Some(max_mb) = config.max_cache_size_mb else {
            return Ok(());
        };
        let current: u64 = self
            .layout
            .list_files()
            .await?
            .iter()
            .filter(|file| !state.removed_paths.contains(&file.path))
            .map(|file| file.size)
            .sum();
        let max_bytes = max_mb.saturating_mul(BYTES_PER_MB);
        if current <= max_bytes {
            debug!(current, max_bytes, "cache within size limit");
            return Ok(());
        }

        let target_bytes = config
            .target_size_mb
            .map(|target| target.saturating_mul(BYTES_PER_MB))
            .unwrap_or(max_bytes / 5 * 4);
        let to_free = current.saturating_sub(target_bytes);
        let grace_cutoff = now - Duration::days(i64::from(config.recently_added_grace_days));
        info!(current, to_free, "cache exceeds size limit");

        let candidates: Vec<CacheEntry> = self
            .entries
            .least_recently_accessed()
            .await?
            .into_iter()
            .filter(|entry| !state.is_removed(entry))
            .take(config.max_deletions_per_run)
            .collect();

        let mut freed = 0u64;
        for entry in candidates {
            if freed >= to_free {
                break;
            }
            if entry.last_fetched_at >= grace_cutoff {
                continue;
            }
            let before = state.run.bytes_freed;
            if self.evict(&entry, state).await? {
                freed += state.run.bytes_freed - before;
                state.run.size_evictions += 1;
            }
        }
        self.flush(state).await?;

        info!(freed, "size pass finished");
        Ok(())
    }

    /// Deletes the entry's file, then queues its row. A file that cannot be
    /// removed keeps its row.
    async fn evict(&self, entry: &CacheEntry, state: &mut RunState) -> Result<bool> {
        if let Some(path) = &entry.file_path
            && !state.removed_paths.contains(path)
            && let Ok(meta) = fs::metadata(path).await
            && meta.is_file()
        {
            if !state.dry_run
                && let Err(e) = remove_file_if_exists(path).await
            {
                state.record_error(format!("File deletion error for {}: {e}", path.display()));
                return Ok(false);
            }
            state.run.files_deleted += 1;
            state.run.bytes_freed += meta.len();
            state.removed_paths.insert(path.clone());
        }
        self.queue_row(entry.id, state).await?;
        Ok(true)
    }

    async fn queue_row(&self, id: Uuid, state: &mut RunState) -> Result<()> {
        state.removed_ids.insert(id);
        state.pending.push(id);
        state.run.records_deleted += 1;
        if state.pending.len() >= state.batch_size {
            self.flush(state).await?;
        }
        Ok(())
    }

    async fn flush(&self, state: &mut RunState) -> Result<()> {
        if state.pending.is_empty() {
            return Ok(());
        }
        if !state.dry_run {
            self.entries.delete(&state.pending).await?;
        }
        state.pending.clear();
        Ok(())
    }

    /// Current usage plus what a default cleanup would reclaim.
    pub async fn status(&self) -> Result<CleanupStatus> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(i64::from(self.defaults.default_retention_days));
        let recent = now - Duration::days(RECENT_ACCESS_DAYS);

        let rows = self.entries.all().await?;
        let mut old_entries = 0;
        let mut recent_entries = 0;
        let mut reclaimable = 0u64;
        for row in &rows {
            if row.last_accessed_at < cutoff {
                old_entries += 1;
                if let Some(path) = &row.file_path
                    && let Ok(meta) = fs::metadata(path).await
                {
                    reclaimable += meta.len();
                }
            }
            if row.last_accessed_at >= recent {
                recent_entries += 1;
            }
        }

        let cache_size_mb = self.layout.statistics().await?.total_mb;
        let over_budget = self
            .defaults
            .max_cache_size_mb
            .is_some_and(|max| cache_size_mb > max as f64);

        Ok(CleanupStatus {
            total_entries: rows.len() as u64,
            old_entries,
            recent_entries,
            cache_size_mb,
            retention_days: self.defaults.default_retention_days,
            recommended_cleanup: old_entries > 0 || over_budget,
            estimated_space_to_free_mb: reclaimable as f64 / BYTES_PER_MB as f64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artwork::SizeVariant;
    use crate::clock::{Clock, ManualClock};
    use crate::database::memory::InMemoryCacheEntryRepository;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        clock: Arc<ManualClock>,
        entries: Arc<InMemoryCacheEntryRepository>,
        layout: Arc<CacheLayout>,
        engine: CleanupEngine,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let entries = Arc::new(InMemoryCacheEntryRepository::new());
        let layout = Arc::new(CacheLayout::new(dir.path().join("cache"), "/static/artwork_cache"));
        layout.ensure_structure().await.unwrap();
        let engine = CleanupEngine::new(
            entries.clone(),
            layout.clone(),
            ReportWriter::new(dir.path().join("logs")),
            clock.clone(),
            CleanupConfig::default(),
        );
        Fixture {
            dir,
            clock,
            entries,
            layout,
            engine,
        }
    }

    impl Fixture {
        async fn entry(&self, key: &str, accessed_days: i64, fetched_days: i64, bytes: usize) -> CacheEntry {
            let now = self.clock.now();
            let path = self.layout.path_for(key, SizeVariant::Medium, None);
            fs::write(&path, vec![0u8; bytes]).await.unwrap();
            let mut entry = CacheEntry::new(1, format!("https://x/{key}"), key, SizeVariant::Medium, now)
                .with_file(path, bytes as u64);
            entry.last_accessed_at = now - Duration::days(accessed_days);
            entry.last_fetched_at = now - Duration::days(fetched_days);
            self.entries.upsert(entry).await.unwrap()
        }
    }

    #[tokio::test]
    async fn minimum_retention_protects_recent_access() {
        let fx = fixture().await;
        fx.entry("old", 400, 400, 10).await;
        fx.entry("used", 20, 400, 10).await;

        let run = fx.engine.cleanup(CleanupConfig::default()).await.unwrap();
        assert!(run.complete);
        assert_eq!(run.records_deleted, 1);
        assert_eq!(run.files_deleted, 1);
        assert_eq!(run.bytes_freed, 10);

        let left = fx.entries.all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].cache_key, "used");
        assert!(run.report_path.as_ref().unwrap().starts_with(fx.dir.path()));
    }

    #[tokio::test]
    async fn recently_fetched_entries_survive_age_pass() {
        let fx = fixture().await;
        fx.entry("fresh", 400, 2, 10).await;

        let run = fx.engine.cleanup(CleanupConfig::default()).await.unwrap();
        assert_eq!(run.records_deleted, 0);
        assert_eq!(fx.entries.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn invalid_records_are_removed() {
        let fx = fixture().await;
        let entry = fx.entry("gone", 1, 1, 10).await;
        fs::remove_file(entry.file_path.as_ref().unwrap()).await.unwrap();

        let run = fx.engine.cleanup(CleanupConfig::default()).await.unwrap();
        assert_eq!(run.invalid_records, 1);
        assert_eq!(fx.entries.count().await.unwrap(), 0);

        let again = fx.engine.cleanup(CleanupConfig::default()).await.unwrap();
        assert_eq!(again.records_deleted, 0);
    }

    #[tokio::test]
    async fn size_budget_evicts_lru_outside_grace() {
        let fx = fixture().await;
        let mb = BYTES_PER_MB as usize;
        fx.entry("a", 100, 100, mb).await;
        fx.entry("b", 50, 50, mb).await;
        fx.entry("c", 40, 1, mb).await;

        let config = CleanupConfig {
            max_cache_size_mb: Some(2),
            ..CleanupConfig::default()
        };
        let run = fx.engine.cleanup(config).await.unwrap();

        // Target 1.6 MB: "a" and "b" go, "c" is within grace.
        assert_eq!(run.size_evictions, 2);
        let left = fx.entries.all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].cache_key, "c");
    }

    #[tokio::test]
    async fn status_reports_reclaimable_space() {
        let fx = fixture().await;
        fx.entry("old", 400, 400, 2048).await;
        fx.entry("new", 1, 1, 1024).await;

        let status = fx.engine.status().await.unwrap();
        assert_eq!(status.total_entries, 2);
        assert_eq!(status.old_entries, 1);
        assert_eq!(status.recent_entries, 1);
        assert!(status.recommended_cleanup);
        assert!(status.estimated_space_to_free_mb > 0.0);
    }
}
