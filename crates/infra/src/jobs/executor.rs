//! Job execution shared by both queue backends.
//!
//! Runs one attempt of a job against its handler and turns the handler's
//! result into a [`Disposition`] the backend acts on (ack, re-park with
//! backoff, or drop).

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::types::{FailureDisposition, Job, JobResult};

/// Consumer of one named queue.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> JobResult;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, job: &Job) -> JobResult {
        (self.0)(job.clone()).await
    }
}

/// Wrap an async closure as a job handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Minimum spacing between outbound attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub per: Duration,
}

impl RateLimit {
    pub fn per_second(max: u32) -> Self {
        Self {
            max,
            per: Duration::from_secs(1),
        }
    }

    fn spacing(&self) -> Duration {
        self.per / self.max.max(1)
    }
}

/// How a consumer runs against the durable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Parallel in-flight executions
    pub concurrency: usize,
    /// Optional cap on attempts per time window, shared by all slots
    pub rate_limit: Option<RateLimit>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            rate_limit: None,
        }
    }
}

impl ConsumerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }
}

/// Spaces acquisitions evenly so at most `max` attempts start per `per` window.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    spacing: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub(crate) fn new(limit: RateLimit) -> Self {
        Self {
            spacing: limit.spacing(),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub(crate) async fn acquire(&self) {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.spacing;
            slot - now
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// What the backend must do with a job after one execution.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Disposition {
    Completed,
    Retry(Job, Duration),
    Dropped(Job),
}

/// Run one attempt of `job`.
///
/// Handler panics count as failures so a buggy handler is retried and
/// eventually dropped instead of taking the consumer down.
pub(crate) async fn execute(mut job: Job, handler: &dyn JobHandler) -> Disposition {
    job.begin_attempt();

    let result = match AssertUnwindSafe(handler.handle(&job)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => JobResult::Failure("job handler panicked".to_string()),
    };

    match result {
        JobResult::Success => {
            debug!(queue = %job.queue, job_id = %job.id, attempt = job.attempts, "job completed");
            Disposition::Completed
        }
        JobResult::Failure(err) => match job.record_failure(err.clone()) {
            FailureDisposition::Retry(delay) => {
                warn!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempt = job.attempts,
                    max_attempts = job.retry_policy.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "job failed; scheduling retry"
                );
                Disposition::Retry(job, delay)
            }
            FailureDisposition::Drop => {
                error!(
                    queue = %job.queue,
                    job_id = %job.id,
                    attempts = job.attempts,
                    error = %err,
                    "job dropped after max attempts"
                );
                Disposition::Dropped(job)
            }
        },
        JobResult::Discard(reason) => {
            error!(queue = %job.queue, job_id = %job.id, reason = %reason, "job discarded");
            job.last_error = Some(reason);
            Disposition::Dropped(job)
        }
    }
}
