//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    #[default]
    Exponential,
}

/// Retry policy carried by every job.
///
/// `max_attempts` counts total executions, the first one included: a policy
/// of 3 runs a failing job at most three times before dropping it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before the retry that follows attempt number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(attempt - 1);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Check if another attempt is allowed after `attempts` executions.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Per-enqueue overrides; unset fields use the queue defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub attempts: Option<u32>,
    pub backoff: Option<Duration>,
}

impl EnqueueOptions {
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub(crate) fn resolve(&self, defaults: &RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.attempts.unwrap_or(defaults.max_attempts).max(1),
            base_delay: self.backoff.unwrap_or(defaults.base_delay),
            ..defaults.clone()
        }
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Queue the job was enqueued on (routes it to one consumer)
    pub queue: String,
    /// JSON payload
    pub payload: serde_json::Value,
    /// Executions already started (0 while waiting for the first run)
    pub attempts: u32,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    /// Earliest time of the next execution (retry backoff)
    pub not_before: Option<DateTime<Utc>>,
    /// Error of the most recent failed attempt
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: serde_json::Value, retry_policy: RetryPolicy) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            attempts: 0,
            retry_policy,
            created_at: Utc::now(),
            not_before: None,
            last_error: None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.not_before {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Mark the start of an execution.
    pub fn begin_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Record a failed execution and decide what happens next.
    pub fn record_failure(&mut self, error: String) -> FailureDisposition {
        self.last_error = Some(error);

        if self.retry_policy.should_retry(self.attempts) {
            let delay = self.retry_policy.delay_for_attempt(self.attempts);
            self.not_before =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            FailureDisposition::Retry(delay)
        } else {
            FailureDisposition::Drop
        }
    }

    /// Deserialize the payload into a typed job body.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// What the queue does with a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-deliver after the given backoff
    Retry(Duration),
    /// Attempt cap reached; drop and log
    Drop,
}

/// Result of job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// Job completed successfully
    Success,
    /// Job failed; the retry policy decides whether it runs again
    Failure(String),
    /// Job can never succeed (e.g. malformed payload); drop without retrying
    Discard(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 50,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        };
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
    }

    #[test]
    fn should_retry_counts_total_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn options_override_defaults() {
        let defaults = RetryPolicy::default();
        let resolved = EnqueueOptions::default()
            .attempts(5)
            .backoff(Duration::from_millis(10))
            .resolve(&defaults);
        assert_eq!(resolved.max_attempts, 5);
        assert_eq!(resolved.base_delay, Duration::from_millis(10));

        let zero = EnqueueOptions::default().attempts(0).resolve(&defaults);
        assert_eq!(zero.max_attempts, 1);
    }

    #[test]
    fn job_failure_and_drop() {
        let mut job = Job::new("email", serde_json::json!({}), RetryPolicy::fixed(2, Duration::ZERO));

        job.begin_attempt();
        assert_eq!(job.record_failure("error 1".into()), FailureDisposition::Retry(Duration::ZERO));
        assert!(job.not_before.is_some());

        job.begin_attempt();
        assert_eq!(job.record_failure("error 2".into()), FailureDisposition::Drop);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("error 2"));
    }

    #[test]
    fn job_serializes_for_the_broker() {
        let job = Job::new("order-processing", serde_json::json!({"type": "created"}), RetryPolicy::default());
        let raw = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, job);
    }
}
