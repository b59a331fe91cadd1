//! Bounded-concurrency background task scheduler.
//!
//! Jobs wait in a priority heap keyed by `(priority, submission order)`:
//! priority 1 runs before priority 10, equal priorities run FIFO. At most
//! `max_concurrent` jobs execute at once. Each job runs in its own tokio task
//! so a failing or panicking job never affects its siblings or the
//! dispatcher.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::clock::SharedClock;

/// Boxed job body; its JSON value becomes the task result.
pub type JobFuture = BoxFuture<'static, anyhow::Result<serde_json::Value>>;
/// Runs with the job's result after it succeeds.
pub type SuccessCallback =
    Box<dyn FnOnce(&serde_json::Value) -> anyhow::Result<()> + Send>;
/// Runs with the error message after the job fails.
pub type ErrorCallback = Box<dyn FnOnce(&str) -> anyhow::Result<()> + Send>;

/// Priority of tasks that do not set one.
pub const DEFAULT_PRIORITY: u8 = 5;
const MIN_PRIORITY: u8 = 1;
const MAX_PRIORITY: u8 = 10;

/// Concurrency and history limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Jobs allowed to run at once.
    pub max_concurrent: usize,
    /// Completed records kept.
    pub completed_history: usize,
    /// Failed records kept.
    pub failed_history: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            completed_history: 100,
            failed_history: 50,
        }
    }
}

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for a slot.
    Queued,
    /// Job in progress.
    Running,
    /// Job returned `Ok`.
    Completed,
    /// Job returned an error or panicked.
    Failed,
}

/// Snapshot of one background task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Task id.
    pub id: String,
    /// Descriptive name given at submission.
    pub name: String,
    /// 1 runs first, 10 last.
    pub priority: u8,
    /// Whether a failure is broadcast.
    pub critical: bool,
    /// Current lifecycle state.
    pub state: TaskState,
    /// When the task was submitted.
    pub queued_at: DateTime<Utc>,
    /// When a slot picked it up.
    pub started_at: Option<DateTime<Utc>>,
    /// When it finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// JSON result of a completed job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error of a failed job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A unit of work to submit.
pub struct TaskSpec {
    name: String,
    priority: u8,
    critical: bool,
    job: JobFuture,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("critical", &self.critical)
            .finish_non_exhaustive()
    }
}

impl TaskSpec {
    /// Wraps `job` as a normal-priority, non-critical task.
    pub fn new<F>(name: impl Into<String>, job: F) -> Self
    where
        F: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            critical: false,
            job: Box::pin(job),
            on_success: None,
            on_error: None,
        }
    }

    /// 1 is the most urgent, 10 the least. Out-of-range values are clamped.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    /// Failures of critical tasks are published on the scheduler's
    /// critical-failure channel.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    /// Sets a callback run after the job succeeds.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&serde_json::Value) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Sets a callback run after the job fails.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&str) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_error = Some(Box::new(callback));
        self
    }
}

/// Published when a critical task fails.
#[derive(Debug, Clone, Serialize)]
pub struct CriticalTaskFailure {
    /// Failed task.
    pub task_id: String,
    /// Its name.
    pub name: String,
    /// Failure message.
    pub error: String,
}

/// Task currently holding a slot.
#[derive(Debug, Clone, Serialize)]
pub struct RunningTask {
    /// Task id.
    pub id: String,
    /// Task name.
    pub name: String,
    /// When it started.
    pub started_at: Option<DateTime<Utc>>,
}

/// Queue and slot usage.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// Tasks waiting.
    pub queued: usize,
    /// Tasks running.
    pub running: usize,
    /// Tasks completed since startup.
    pub completed: u64,
    /// Tasks failed since startup.
    pub failed: u64,
    /// Effective slot count.
    pub max_concurrent: usize,
    /// Set once shutdown has begun.
    pub shutdown: bool,
    /// Tasks holding a slot.
    pub running_tasks: Vec<RunningTask>,
}

/// Retained records of finished tasks, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct TaskHistory {
    /// Completed tasks.
    pub completed: Vec<TaskRecord>,
    /// Failed tasks.
    pub failed: Vec<TaskRecord>,
}

struct QueuedTask {
    record: TaskRecord,
    sequence: u64,
    job: JobFuture,
    on_success: Option<SuccessCallback>,
    on_error: Option<ErrorCallback>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.record.priority == other.record.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Lower priority number first, then earlier submission
        other
            .record
            .priority
            .cmp(&self.record.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<QueuedTask>,
    running: HashMap<String, TaskRecord>,
    completed: VecDeque<TaskRecord>,
    failed: VecDeque<TaskRecord>,
    completed_total: u64,
    failed_total: u64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    clock: SharedClock,
    state: Mutex<SchedulerState>,
    sequence: AtomicU64,
    shutdown: AtomicBool,
    wake: Notify,
    settled: Notify,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    critical_tx: broadcast::Sender<CriticalTaskFailure>,
}

/// Cloneable handle to the background scheduler.
#[derive(Clone)]
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for BackgroundScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (queued, running) = self
            .inner
            .state
            .try_lock()
            .map(|state| (state.queue.len(), state.running.len()))
            .unwrap_or((0, 0));

        f.debug_struct("BackgroundScheduler")
            .field("config", &self.inner.config)
            .field("queued", &queued)
            .field("running", &running)
            .field("shutdown", &self.inner.shutdown.load(AtomicOrdering::SeqCst))
            .finish()
    }
}

impl BackgroundScheduler {
    /// Builds an idle scheduler. A `max_concurrent` of zero is raised to one.
    pub fn new(mut config: SchedulerConfig, clock: SharedClock) -> Self {
        let (critical_tx, _) = broadcast::channel(16);
        config.max_concurrent = config.max_concurrent.max(1);
        let max_concurrent = config.max_concurrent;
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                clock,
                state: Mutex::new(SchedulerState::default()),
                sequence: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
                wake: Notify::new(),
                settled: Notify::new(),
                permits: Arc::new(Semaphore::new(max_concurrent)),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                dispatcher: Mutex::new(None),
                critical_tx,
            }),
        }
    }

    /// Spawns the dispatcher loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut dispatcher = self.inner.dispatcher.lock();
        if dispatcher.is_some() {
            warn!("background scheduler already started");
            return;
        }
        let inner = self.inner.clone();
        *dispatcher = Some(tokio::spawn(dispatch_loop(inner)));
        info!(
            max_concurrent = self.inner.config.max_concurrent,
            "background scheduler started"
        );
    }

    /// Stops dispatching and waits for running jobs to settle. Jobs still
    /// queued stay queued and are reported in the log.
    pub async fn stop(&self) {
        self.inner.shutdown.store(true, AtomicOrdering::SeqCst);
        self.inner.cancel.cancel();

        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "scheduler dispatcher ended abnormally");
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let abandoned = self.inner.state.lock().queue.len();
        info!(abandoned, "background scheduler stopped");
    }

    /// Queues a task and returns its id.
    pub fn submit(&self, spec: TaskSpec) -> String {
        let sequence = self.inner.sequence.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let now = self.inner.clock.now();
        let id = format!("task_{}_{}", sequence, now.timestamp());

        let record = TaskRecord {
            id: id.clone(),
            name: spec.name,
            priority: spec.priority,
            critical: spec.critical,
            state: TaskState::Queued,
            queued_at: now,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
        };
        debug!(task_id = %id, name = %record.name, priority = record.priority, "task queued");

        self.inner.state.lock().queue.push(QueuedTask {
            record,
            sequence,
            job: spec.job,
            on_success: spec.on_success,
            on_error: spec.on_error,
        });
        self.inner.wake.notify_one();
        id
    }

    /// Queue and slot snapshot.
    pub fn status(&self) -> SchedulerStatus {
        let state = self.inner.state.lock();
        let mut running_tasks: Vec<RunningTask> = state
            .running
            .values()
            .map(|record| RunningTask {
                id: record.id.clone(),
                name: record.name.clone(),
                started_at: record.started_at,
            })
            .collect();
        running_tasks.sort_by(|a, b| a.started_at.cmp(&b.started_at));

        SchedulerStatus {
            queued: state.queue.len(),
            running: state.running.len(),
            completed: state.completed_total,
            failed: state.failed_total,
            max_concurrent: self.inner.config.max_concurrent,
            shutdown: self.inner.shutdown.load(AtomicOrdering::SeqCst),
            running_tasks,
        }
    }

    /// Most recent settled tasks first.
    pub fn history(&self, limit: usize) -> TaskHistory {
        let state = self.inner.state.lock();
        TaskHistory {
            completed: state.completed.iter().rev().take(limit).cloned().collect(),
            failed: state.failed.iter().rev().take(limit).cloned().collect(),
        }
    }

    /// Looks up a task that is queued, running or still in history.
    pub fn task(&self, id: &str) -> Option<TaskRecord> {
        let state = self.inner.state.lock();
        if let Some(record) = state.running.get(id) {
            return Some(record.clone());
        }
        state
            .queue
            .iter()
            .map(|queued| &queued.record)
            .chain(state.completed.iter())
            .chain(state.failed.iter())
            .find(|record| record.id == id)
            .cloned()
    }

    /// Receiver for failures of critical tasks.
    pub fn subscribe_critical(&self) -> broadcast::Receiver<CriticalTaskFailure> {
        self.inner.critical_tx.subscribe()
    }

    /// Waits until nothing is queued or running, up to `timeout`. Returns
    /// whether the scheduler went idle.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let settled = self.inner.settled.notified();
                tokio::pin!(settled);
                settled.as_mut().enable();
                {
                    let state = self.inner.state.lock();
                    if state.queue.is_empty() && state.running.is_empty() {
                        return;
                    }
                }
                settled.await;
            }
        })
        .await
        .is_ok()
    }
}

async fn dispatch_loop(inner: Arc<SchedulerInner>) {
    loop {
        let permit = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            permit = inner.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task = loop {
            if let Some(task) = take_next(&inner) {
                break Some(task);
            }
            tokio::select! {
                _ = inner.cancel.cancelled() => break None,
                _ = inner.wake.notified() => {}
            }
        };

        let Some(task) = task else {
            break;
        };
        inner.tracker.spawn(execute(inner.clone(), task, permit));
    }
    debug!("scheduler dispatcher exited");
}

/// Pops the next task and marks it running under a single lock so the
/// scheduler never looks idle between the two steps.
fn take_next(inner: &SchedulerInner) -> Option<QueuedTask> {
    let mut state = inner.state.lock();
    let mut task = state.queue.pop()?;
    task.record.state = TaskState::Running;
    task.record.started_at = Some(inner.clock.now());
    state
        .running
        .insert(task.record.id.clone(), task.record.clone());
    Some(task)
}

async fn execute(inner: Arc<SchedulerInner>, task: QueuedTask, permit: OwnedSemaphorePermit) {
    let QueuedTask {
        mut record,
        job,
        on_success,
        on_error,
        ..
    } = task;

    info!(task_id = %record.id, name = %record.name, "task started");
    let outcome = match tokio::spawn(job).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(join) => Err(format!("task panicked: {join}")),
    };
    drop(permit);

    record.completed_at = Some(inner.clock.now());
    match &outcome {
        Ok(value) => {
            record.state = TaskState::Completed;
            record.result = Some(value.clone());
            info!(task_id = %record.id, name = %record.name, "task completed");
        }
        Err(message) => {
            record.state = TaskState::Failed;
            record.error = Some(message.clone());
            error!(task_id = %record.id, name = %record.name, error = %message, "task failed");
        }
    }

    // Callbacks run before the task leaves the running set so waiters see
    // their effects once the scheduler reports idle.
    match &outcome {
        Ok(value) => {
            if let Some(callback) = on_success {
                run_callback(&record, "on_success", || callback(value));
            }
        }
        Err(message) => {
            if let Some(callback) = on_error {
                run_callback(&record, "on_error", || callback(message));
            }
            if record.critical {
                let _ = inner.critical_tx.send(CriticalTaskFailure {
                    task_id: record.id.clone(),
                    name: record.name.clone(),
                    error: message.clone(),
                });
            }
        }
    }

    {
        let mut state = inner.state.lock();
        state.running.remove(&record.id);
        let (ring, capacity) = match record.state {
            TaskState::Completed => {
                state.completed_total += 1;
                (&mut state.completed, inner.config.completed_history)
            }
            _ => {
                state.failed_total += 1;
                (&mut state.failed, inner.config.failed_history)
            }
        };
        ring.push_back(record.clone());
        while ring.len() > capacity {
            ring.pop_front();
        }
    }

    inner.settled.notify_waiters();
}

fn run_callback<F>(record: &TaskRecord, which: &str, callback: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(task_id = %record.id, callback = which, error = %err, "task callback failed");
        }
        Err(_) => {
            warn!(task_id = %record.id, callback = which, "task callback panicked");
        }
    }
}
