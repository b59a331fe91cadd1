//! Time-of-day driven maintenance.
//!
//! Checked once a minute. A task fires when the wall clock (UTC) matches its
//! hour and minute (and weekday, for weekly tasks), it has not run today and
//! its previous run has settled. `last_run` is set at submission, so a run
//! that crashes is not retried until the next window.

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cleanup::{CleanupConfig, CleanupEngine};
use crate::clock::SharedClock;
use crate::integrity::IntegrityChecker;
use crate::memory_cache::ArtworkMemoryCache;
use crate::reports::{ReportWriter, SCHEDULED_REPORTS};
use crate::scheduler::{BackgroundScheduler, TaskSpec};

/// Maintenance yields to fetches and refreshes.
pub const SCHEDULED_PRIORITY: u8 = 7;
/// Task name of an on-demand cleanup.
pub const MANUAL_CLEANUP_TASK: &str = "manual_cache_cleanup";
const QUICK_CHECK_WARN_SCORE: f64 = 90.0;
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// How often a schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Every day at the configured time.
    Daily,
    /// Once a week on the configured day.
    Weekly,
}

/// When a maintenance task fires, at minute resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskSchedule {
    /// Disabled schedules never fire.
    pub enabled: bool,
    /// Daily or weekly.
    pub frequency: Frequency,
    /// Only consulted for weekly schedules.
    pub day: Weekday,
    /// Time of day, UTC.
    pub time: NaiveTime,
}

impl TaskSchedule {
    /// Enabled schedule firing every day at `hour:minute`.
    pub fn daily(hour: u32, minute: u32) -> Self {
        Self {
            enabled: true,
            frequency: Frequency::Daily,
            day: Weekday::Mon,
            time: NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or_default(),
        }
    }

    /// Enabled schedule firing on `day` at `hour:minute`.
    pub fn weekly(day: Weekday, hour: u32, minute: u32) -> Self {
        Self {
            frequency: Frequency::Weekly,
            day,
            ..Self::daily(hour, minute)
        }
    }

    /// Same schedule, switched off.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether `now` falls in this schedule's minute.
    pub fn matches(&self, now: DateTime<Utc>) -> bool {
        let day_matches = match self.frequency {
            Frequency::Daily => true,
            Frequency::Weekly => now.weekday() == self.day,
        };
        day_matches && now.hour() == self.time.hour() && now.minute() == self.time.minute()
    }
}

/// Schedules and parameters of every maintenance task.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTasksConfig {
    /// Retention cleanup.
    pub cache_cleanup: TaskSchedule,
    /// Retention applied by scheduled cleanups.
    pub cleanup_retention_days: u32,
    /// Disk budget applied by scheduled cleanups.
    pub cleanup_max_size_mb: Option<u64>,
    /// Run scheduled cleanups without deleting.
    pub cleanup_dry_run: bool,
    /// Full memory cache clear.
    pub memory_cache_clear: TaskSchedule,
    /// Weekly cache report.
    pub reports: TaskSchedule,
    /// Full integrity check.
    pub integrity_check: TaskSchedule,
    /// Let the full check repair what it finds.
    pub integrity_auto_repair: bool,
    /// Sampled integrity check.
    pub integrity_quick_check: TaskSchedule,
}

impl Default for ScheduledTasksConfig {
    fn default() -> Self {
        Self {
            cache_cleanup: TaskSchedule::daily(3, 0),
            cleanup_retention_days: 365,
            cleanup_max_size_mb: Some(5000),
            cleanup_dry_run: false,
            memory_cache_clear: TaskSchedule::weekly(Weekday::Sun, 4, 0),
            reports: TaskSchedule::weekly(Weekday::Mon, 9, 0),
            integrity_check: TaskSchedule::weekly(Weekday::Sun, 2, 0),
            integrity_auto_repair: true,
            integrity_quick_check: TaskSchedule::daily(1, 0),
        }
    }
}

/// The maintenance tasks the runner knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScheduledTask {
    /// Retention cleanup.
    CacheCleanup,
    /// Memory cache clear.
    MemoryCacheClear,
    /// Cache report.
    Reports,
    /// Full integrity check.
    IntegrityCheck,
    /// Sampled integrity check.
    IntegrityQuickCheck,
}

impl ScheduledTask {
    /// Every task, in status order.
    pub const ALL: [ScheduledTask; 5] = [
        ScheduledTask::CacheCleanup,
        ScheduledTask::MemoryCacheClear,
        ScheduledTask::Reports,
        ScheduledTask::IntegrityCheck,
        ScheduledTask::IntegrityQuickCheck,
    ];

    /// Name used in task records, reports and status output.
    pub fn name(&self) -> &'static str {
        match self {
            ScheduledTask::CacheCleanup => "cache_cleanup",
            ScheduledTask::MemoryCacheClear => "memory_cache_clear",
            ScheduledTask::Reports => "reports",
            ScheduledTask::IntegrityCheck => "integrity_check",
            ScheduledTask::IntegrityQuickCheck => "integrity_quick_check",
        }
    }

    fn schedule<'a>(&self, config: &'a ScheduledTasksConfig) -> &'a TaskSchedule {
        match self {
            ScheduledTask::CacheCleanup => &config.cache_cleanup,
            ScheduledTask::MemoryCacheClear => &config.memory_cache_clear,
            ScheduledTask::Reports => &config.reports,
            ScheduledTask::IntegrityCheck => &config.integrity_check,
            ScheduledTask::IntegrityQuickCheck => &config.integrity_quick_check,
        }
    }
}

/// Bookkeeping for one scheduled task.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskRunState {
    /// Last time the schedule fired.
    pub last_run: Option<DateTime<Utc>>,
    /// Whether its job is still in flight.
    pub running: bool,
    /// Scheduler id of the most recent job.
    pub task_id: Option<String>,
}

/// Runner state as exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduledStatus {
    /// Whether the tick loop is active.
    pub running: bool,
    /// Effective configuration.
    pub config: ScheduledTasksConfig,
    /// State per task, keyed by name.
    pub tasks: BTreeMap<&'static str, TaskRunState>,
}

/// Components the maintenance tasks operate on.
#[derive(Debug, Clone)]
pub struct MaintenanceTargets {
    /// Retention cleanup engine.
    pub cleanup: Arc<CleanupEngine>,
    /// Integrity checker.
    pub integrity: Arc<IntegrityChecker>,
    /// Memory cache.
    pub memory: Arc<ArtworkMemoryCache>,
    /// Report output.
    pub reports: ReportWriter,
}

struct RunnerInner {
    config: ScheduledTasksConfig,
    scheduler: BackgroundScheduler,
    targets: MaintenanceTargets,
    clock: SharedClock,
    tasks: Mutex<BTreeMap<ScheduledTask, TaskRunState>>,
    cancel: CancellationToken,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

/// Fires maintenance tasks on their schedules through the background scheduler.
#[derive(Clone)]
pub struct ScheduledTaskRunner {
    inner: Arc<RunnerInner>,
}

impl std::fmt::Debug for ScheduledTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTaskRunner")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ScheduledTaskRunner {
    /// Builds a stopped runner; call [`ScheduledTaskRunner::start`] to begin ticking.
    pub fn new(
        config: ScheduledTasksConfig,
        scheduler: BackgroundScheduler,
        targets: MaintenanceTargets,
        clock: SharedClock,
    ) -> Self {
        let tasks = ScheduledTask::ALL
            .into_iter()
            .map(|task| (task, TaskRunState::default()))
            .collect();
        Self {
            inner: Arc::new(RunnerInner {
                config,
                scheduler,
                targets,
                clock,
                tasks: Mutex::new(tasks),
                cancel: CancellationToken::new(),
                ticker: Mutex::new(None),
            }),
        }
    }

    /// Effective configuration.
    pub fn config(&self) -> &ScheduledTasksConfig {
        &self.inner.config
    }

    /// Spawns the once-a-minute check loop.
    pub fn start(&self) {
        let mut ticker = self.inner.ticker.lock();
        if ticker.is_some() {
            warn!("scheduled task runner already started");
            return;
        }

        let runner = self.clone();
        let cancel = self.inner.cancel.clone();
        *ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        runner.tick(runner.inner.clock.now());
                    }
                }
            }
            debug!("scheduled task loop exited");
        }));
        info!("scheduled task runner started");
    }

    /// Cancels the tick loop and waits for it to exit.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.ticker.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("scheduled task loop ended abnormally: {e}");
        }
        info!("scheduled task runner stopped");
    }

    /// True when `task` is enabled and due at `now`, is not running, and has
    /// not already fired today.
    pub fn should_run(&self, task: ScheduledTask, now: DateTime<Utc>) -> bool {
        let schedule = task.schedule(&self.inner.config);
        if !schedule.enabled || !schedule.matches(now) {
            return false;
        }
        let tasks = self.inner.tasks.lock();
        let Some(state) = tasks.get(&task) else {
            return false;
        };
        let ran_today = state
            .last_run
            .is_some_and(|last| last.date_naive() == now.date_naive());
        !ran_today && !state.running
    }

    /// Submits every task due at `now`. Returns the submitted task ids.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<(ScheduledTask, String)> {
        ScheduledTask::ALL
            .into_iter()
            .filter(|task| self.should_run(*task, now))
            .map(|task| {
                let task_id = self.submit(task, None);
                (task, task_id)
            })
            .collect()
    }

    /// Runs cleanup immediately with the scheduled settings, optionally as
    /// a dry run. Leaves the schedule's `last_run` and running guard alone,
    /// so the day's scheduled cleanup still fires.
    pub fn trigger_cleanup_now(&self, dry_run: Option<bool>) -> String {
        let job = self.job(ScheduledTask::CacheCleanup, dry_run);
        let spec = TaskSpec::new(MANUAL_CLEANUP_TASK, job).priority(SCHEDULED_PRIORITY);
        let task_id = self.inner.scheduler.submit(spec);
        info!(task_id = %task_id, ?dry_run, "manual cache cleanup submitted");
        task_id
    }

    fn submit(&self, task: ScheduledTask, dry_run: Option<bool>) -> String {
        let now = self.inner.clock.now();
        {
            let mut tasks = self.inner.tasks.lock();
            let state = tasks.entry(task).or_default();
            state.running = true;
            state.last_run = Some(now);
        }

        let job = self.job(task, dry_run);
        let on_success = self.settle(task);
        let on_error = self.settle(task);
        let spec = TaskSpec::new(task.name(), job)
            .priority(SCHEDULED_PRIORITY)
            .on_success(move |_| {
                on_success();
                Ok(())
            })
            .on_error(move |_| {
                on_error();
                Ok(())
            });

        let task_id = self.inner.scheduler.submit(spec);
        if let Some(state) = self.inner.tasks.lock().get_mut(&task) {
            state.task_id = Some(task_id.clone());
        }
        info!(task = task.name(), task_id = %task_id, "scheduled task submitted");
        task_id
    }

    fn settle(&self, task: ScheduledTask) -> impl FnOnce() + Send + 'static {
        let inner = self.inner.clone();
        move || {
            if let Some(state) = inner.tasks.lock().get_mut(&task) {
                state.running = false;
            }
        }
    }

    fn job(
        &self,
        task: ScheduledTask,
        dry_run: Option<bool>,
    ) -> impl Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static {
        let inner = self.inner.clone();
        async move {
            let targets = &inner.targets;
            let config = &inner.config;
            let result = match task {
                ScheduledTask::CacheCleanup => {
                    let cleanup_config = CleanupConfig {
                        default_retention_days: config.cleanup_retention_days,
                        max_cache_size_mb: config.cleanup_max_size_mb,
                        dry_run: dry_run.unwrap_or(config.cleanup_dry_run),
                        ..targets.cleanup.defaults().clone()
                    };
                    serde_json::to_value(targets.cleanup.cleanup(cleanup_config).await?)?
                }
                ScheduledTask::MemoryCacheClear => {
                    let freed_mb = targets.memory.stats().memory.mb_total;
                    let cleared = targets.memory.clear();
                    json!({
                        "cleared_at": inner.clock.now(),
                        "entries_cleared": cleared,
                        "memory_freed_mb": freed_mb,
                    })
                }
                ScheduledTask::Reports => {
                    let cleanup_status = targets.cleanup.status().await?;
                    json!({
                        "generated_at": inner.clock.now(),
                        "cleanup_status": cleanup_status,
                        "memory_cache": targets.memory.stats(),
                        "scheduler": inner.scheduler.status(),
                    })
                }
                ScheduledTask::IntegrityCheck => serde_json::to_value(
                    targets.integrity.verify(config.integrity_auto_repair, None).await,
                )?,
                ScheduledTask::IntegrityQuickCheck => {
                    let report = targets.integrity.quick_check().await?;
                    if report.estimated_integrity_score < QUICK_CHECK_WARN_SCORE {
                        warn!(
                            score = report.estimated_integrity_score,
                            "cache integrity below threshold, consider a full check"
                        );
                    }
                    serde_json::to_value(report)?
                }
            };

            if let Err(e) = targets
                .reports
                .write(Some(SCHEDULED_REPORTS), task.name(), inner.clock.now(), &result)
                .await
            {
                warn!(task = task.name(), "failed to save scheduled task result: {e}");
            }
            Ok(result)
        }
    }

    /// Snapshot of the runner and every task.
    pub fn status(&self) -> ScheduledStatus {
        let tasks = self
            .inner
            .tasks
            .lock()
            .iter()
            .map(|(task, state)| (task.name(), state.clone()))
            .collect();
        ScheduledStatus {
            running: self.inner.ticker.lock().is_some() && !self.inner.cancel.is_cancelled(),
            config: self.inner.config.clone(),
            tasks,
        }
    }
}
