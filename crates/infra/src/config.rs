//! Process configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::jobs::{QueueSettings, RateLimit, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub struct CoreConfig {
    /// `REDIS_URL`; unset selects the in-memory job queue
    pub redis_url: Option<String>,
    /// `SITE_URL`, sent as `X-WC-Webhook-Source`
    pub site_url: String,
    /// `DATABASE_URL`; unset keeps all state in memory
    pub database_url: Option<String>,
    /// `BIND_ADDR` of the HTTP server
    pub bind_addr: String,
    pub queue_default_attempts: u32,
    pub queue_backoff: Duration,
    pub webhook_timeout: Duration,
    pub webhook_concurrency: usize,
    /// Outbound webhook attempts per second; `0` disables the limit
    pub webhook_rate_limit: u32,
    pub email_concurrency: usize,
    pub order_concurrency: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            site_url: "http://localhost:3000".to_string(),
            database_url: None,
            bind_addr: "0.0.0.0:3000".to_string(),
            queue_default_attempts: 3,
            queue_backoff: Duration::from_millis(1000),
            webhook_timeout: Duration::from_secs(30),
            webhook_concurrency: 5,
            webhook_rate_limit: 10,
            email_concurrency: 3,
            order_concurrency: 5,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable numbers keep their
    /// default and log a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let text = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            redis_url: text("REDIS_URL"),
            site_url: text("SITE_URL").unwrap_or(d.site_url),
            database_url: text("DATABASE_URL"),
            bind_addr: text("BIND_ADDR").unwrap_or(d.bind_addr),
            queue_default_attempts: number(&lookup, "QUEUE_DEFAULT_ATTEMPTS", d.queue_default_attempts),
            queue_backoff: Duration::from_millis(number(
                &lookup,
                "QUEUE_BACKOFF_MS",
                d.queue_backoff.as_millis() as u64,
            )),
            webhook_timeout: Duration::from_millis(number(
                &lookup,
                "WEBHOOK_TIMEOUT_MS",
                d.webhook_timeout.as_millis() as u64,
            )),
            webhook_concurrency: number(&lookup, "WEBHOOK_CONCURRENCY", d.webhook_concurrency),
            webhook_rate_limit: number_or_zero(&lookup, "WEBHOOK_RATE_LIMIT", d.webhook_rate_limit),
            email_concurrency: number(&lookup, "EMAIL_CONCURRENCY", d.email_concurrency),
            order_concurrency: number(&lookup, "ORDER_CONCURRENCY", d.order_concurrency),
        }
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            redis_url: self.redis_url.clone(),
            default_retry: RetryPolicy::exponential(self.queue_default_attempts, self.queue_backoff),
            ..Default::default()
        }
    }

    pub fn webhook_rate(&self) -> Option<RateLimit> {
        (self.webhook_rate_limit > 0).then(|| RateLimit::per_second(self.webhook_rate_limit))
    }
}

fn number<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + PartialOrd + Default + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(v) if v > T::default() => v,
        _ => {
            warn!(key, value = %raw, default = %default, "invalid numeric setting; using default");
            default
        }
    }
}

/// Like [`number`], but `0` is a meaningful value.
fn number_or_zero(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    match lookup(key) {
        Some(raw) if raw.trim() == "0" => 0,
        _ => number(lookup, key, default),
    }
}
