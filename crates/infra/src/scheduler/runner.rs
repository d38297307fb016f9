use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{Schedule, ScheduleHandler, SchedulerError};
use crate::store::{ScheduleStore, ScheduledTaskRecord};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Period of the shared tick that drives cron tasks.
    pub tick_period: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(60),
        }
    }
}

/// What happened when a task was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    /// A previous invocation was still in flight, or the task was removed.
    Skipped,
}

struct TaskEntry {
    record: Mutex<ScheduledTaskRecord>,
    schedule: Schedule,
    handler: Arc<dyn ScheduleHandler>,
    running: AtomicBool,
    removed: AtomicBool,
    trigger: Option<CancellationToken>,
}

impl TaskEntry {
    fn snapshot(&self) -> ScheduledTaskRecord {
        self.record.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut ScheduledTaskRecord)) -> ScheduledTaskRecord {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut record);
        record.clone()
    }
}

/// Holds a task's in-flight flag; clears it on drop, whatever the exit path.
struct RunningGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct Inner {
    store: Arc<dyn ScheduleStore>,
    tasks: RwLock<HashMap<String, Arc<TaskEntry>>>,
    cancel: CancellationToken,
    tick_period: Duration,
    ticker_started: AtomicBool,
}

/// Process-wide task scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick_period", &self.inner.tick_period)
            .field("tasks", &self.inner.read_tasks().len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(store: Arc<dyn ScheduleStore>) -> Self {
        Self::with_options(store, SchedulerOptions::default())
    }

    pub fn with_options(store: Arc<dyn ScheduleStore>, options: SchedulerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tasks: RwLock::new(HashMap::new()),
                cancel: CancellationToken::new(),
                tick_period: options.tick_period,
                ticker_started: AtomicBool::new(false),
            }),
        }
    }

    /// Register `schedule_id` for `plugin_id` and start driving it.
    ///
    /// A persisted `next_run` still in the future is resumed; one in the past
    /// is skipped forward without backfilling missed runs. A stale persisted
    /// `is_running` flag is cleared. Returns the task id.
    #[instrument(skip(self, description, handler))]
    pub async fn register(
        &self,
        plugin_id: &str,
        schedule_id: &str,
        schedule: &str,
        description: Option<String>,
        handler: Arc<dyn ScheduleHandler>,
    ) -> Result<String, SchedulerError> {
        let parsed = Schedule::parse(schedule)?;
        let id = ScheduledTaskRecord::task_id(plugin_id, schedule_id);
        if self.inner.read_tasks().contains_key(&id) {
            return Err(SchedulerError::DuplicateTask(id));
        }

        let now = Utc::now();
        let interval_ms = parsed.interval_ms();
        let cron_expression = parsed.cron_expression();
        let persisted = self.inner.store.get_task(&id).await?;

        let (next_run, last_run, is_enabled) = match persisted {
            Some(prev)
                if prev.interval_ms == interval_ms && prev.cron_expression == cron_expression =>
            {
                let next_run = match prev.next_run {
                    Some(at) if at > now => at,
                    _ => parsed.next_run(now),
                };
                if prev.is_running {
                    warn!(task_id = %id, "clearing stale running flag");
                }
                (next_run, prev.last_run, prev.is_enabled)
            }
            Some(prev) => (parsed.next_run(now), prev.last_run, prev.is_enabled),
            None => (parsed.next_run(now), None, true),
        };

        let record = ScheduledTaskRecord {
            id: id.clone(),
            plugin_id: plugin_id.to_string(),
            schedule_id: schedule_id.to_string(),
            cron_expression,
            interval_ms,
            next_run: Some(next_run),
            last_run,
            is_running: false,
            is_enabled,
            description,
        };
        self.inner.store.save_task(&record).await?;

        let trigger = interval_ms.map(|_| self.inner.cancel.child_token());
        let entry = Arc::new(TaskEntry {
            record: Mutex::new(record),
            schedule: parsed,
            handler,
            running: AtomicBool::new(false),
            removed: AtomicBool::new(false),
            trigger: trigger.clone(),
        });

        {
            let mut tasks = self.inner.write_tasks();
            if tasks.contains_key(&id) {
                return Err(SchedulerError::DuplicateTask(id));
            }
            tasks.insert(id.clone(), entry.clone());
        }

        match (&entry.schedule, trigger) {
            (Schedule::Interval(period), Some(token)) => {
                let delay = (next_run - now).to_std().unwrap_or(Duration::ZERO);
                self.spawn_trigger(entry.clone(), *period, delay, token);
            }
            _ => self.ensure_ticker(),
        }

        info!(task_id = %id, interval_ms, next_run = %next_run, "scheduled task registered");
        Ok(id)
    }

    /// Stop and remove every task owned by `plugin_id`, including persisted rows.
    #[instrument(skip(self))]
    pub async fn unregister_plugin(&self, plugin_id: &str) -> Result<usize, SchedulerError> {
        let removed: Vec<Arc<TaskEntry>> = {
            let mut tasks = self.inner.write_tasks();
            let ids: Vec<String> = tasks
                .iter()
                .filter(|(_, entry)| entry.snapshot().plugin_id == plugin_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| tasks.remove(id)).collect()
        };

        for entry in &removed {
            entry.removed.store(true, Ordering::Release);
            if let Some(token) = &entry.trigger {
                token.cancel();
            }
        }

        let rows = self.inner.store.delete_plugin_tasks(plugin_id).await?;
        debug!(plugin_id, tasks = removed.len(), rows, "plugin tasks removed");
        Ok(removed.len())
    }

    /// Run a task immediately, under the same in-flight guard as the triggers.
    pub async fn run_now(&self, task_id: &str) -> Result<RunOutcome, SchedulerError> {
        let entry = self
            .inner
            .read_tasks()
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        Ok(self.inner.run_task(&entry).await)
    }

    /// Enable or disable a task. Disabled tasks keep their trigger but skip runs.
    pub async fn set_enabled(&self, task_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let entry = self
            .inner
            .read_tasks()
            .get(task_id)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(task_id.to_string()))?;
        let record = entry.update(|r| r.is_enabled = enabled);
        self.inner.store.save_task(&record).await?;
        Ok(())
    }

    /// Snapshot of every registered task, ordered by id.
    pub fn tasks(&self) -> Vec<ScheduledTaskRecord> {
        let mut tasks: Vec<_> = self.inner.read_tasks().values().map(|e| e.snapshot()).collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn tasks_for_plugin(&self, plugin_id: &str) -> Vec<ScheduledTaskRecord> {
        self.tasks().into_iter().filter(|t| t.plugin_id == plugin_id).collect()
    }

    /// Whether the task is driven by its own trigger rather than the shared tick.
    pub fn has_dedicated_trigger(&self, task_id: &str) -> bool {
        self.inner
            .read_tasks()
            .get(task_id)
            .is_some_and(|e| e.trigger.as_ref().is_some_and(|t| !t.is_cancelled()))
    }

    /// Run every enabled cron task due at `now`, one after another.
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        self.inner.run_due(now).await
    }

    /// Cancel every trigger and the shared tick. In-flight runs finish on their own.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        info!("scheduler stopped");
    }

    fn spawn_trigger(
        &self,
        entry: Arc<TaskEntry>,
        period: Duration,
        delay: Duration,
        token: CancellationToken,
    ) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let inner = inner.clone();
                        let entry = entry.clone();
                        tokio::spawn(async move {
                            if entry.snapshot().is_enabled {
                                inner.run_task(&entry).await;
                            }
                        });
                    }
                }
            }
        });
    }

    fn ensure_ticker(&self) {
        if self.inner.ticker_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let period = inner.tick_period;
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.run_due(Utc::now()).await;
                    }
                }
            }
        });
    }
}

impl Inner {
    fn read_tasks(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<TaskEntry>>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tasks(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<TaskEntry>>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let mut due: Vec<(DateTime<Utc>, Arc<TaskEntry>)> = self
            .read_tasks()
            .values()
            .filter(|e| e.trigger.is_none())
            .filter_map(|e| {
                let record = e.snapshot();
                let next = record.next_run?;
                (record.is_enabled && next <= now).then(|| (next, e.clone()))
            })
            .collect();
        due.sort_by_key(|(next, _)| *next);

        let mut ran = 0;
        for (_, entry) in due {
            if self.run_task(&entry).await != RunOutcome::Skipped {
                ran += 1;
            }
        }
        ran
    }

    async fn persist(&self, entry: &TaskEntry, record: &ScheduledTaskRecord) {
        if entry.removed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.store.save_task(record).await {
            warn!(task_id = %record.id, error = %e, "failed to persist task state");
        }
    }

    async fn run_task(&self, entry: &TaskEntry) -> RunOutcome {
        if entry.removed.load(Ordering::Acquire) {
            return RunOutcome::Skipped;
        }
        let Some(_guard) = RunningGuard::acquire(&entry.running) else {
            debug!(task_id = %entry.snapshot().id, "task still running, skipping");
            return RunOutcome::Skipped;
        };

        let started = Utc::now();
        let record = entry.update(|r| r.is_running = true);
        self.persist(entry, &record).await;

        let outcome = match AssertUnwindSafe(entry.handler.run()).catch_unwind().await {
            Ok(Ok(())) => RunOutcome::Completed,
            Ok(Err(e)) => RunOutcome::Failed(format!("{e:#}")),
            Err(_) => RunOutcome::Failed("task panicked".to_string()),
        };
        if let RunOutcome::Failed(reason) = &outcome {
            error!(task_id = %record.id, error = %reason, "scheduled task failed");
        }

        let finished = Utc::now();
        let record = entry.update(|r| {
            r.is_running = false;
            r.last_run = Some(started);
            r.next_run = Some(entry.schedule.next_run(finished));
        });
        self.persist(entry, &record).await;
        outcome
    }
}
