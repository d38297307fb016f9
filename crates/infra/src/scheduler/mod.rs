//! Recurring plugin tasks.
//!
//! A task is either an interval (`5m`, `30s`, ...) or a 5-field cron
//! expression. Interval tasks each get a dedicated trigger firing every
//! interval; cron tasks share one per-minute tick that runs every due task in
//! turn. Next/last run times are persisted so schedules survive restarts.

mod cron;
mod runner;
mod schedule;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::store::StoreError;

pub use cron::{CronError, CronExpr, MAX_SCAN_MINUTES, next_cron_run};
pub use runner::{RunOutcome, Scheduler, SchedulerOptions};
pub use schedule::Schedule;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("task {0} is already registered")]
    DuplicateTask(String),

    #[error("task {0} not found")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Body of a scheduled task.
#[async_trait]
pub trait ScheduleHandler: Send + Sync + 'static {
    async fn run(&self) -> anyhow::Result<()>;
}

struct FnSchedule<F>(F);

#[async_trait]
impl<F, Fut> ScheduleHandler for FnSchedule<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self) -> anyhow::Result<()> {
        (self.0)().await
    }
}

/// Wrap an async closure as a schedule handler.
pub fn schedule_fn<F, Fut>(f: F) -> Arc<dyn ScheduleHandler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnSchedule(f))
}
