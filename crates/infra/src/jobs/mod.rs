//! Background job queue with retry, backoff, and a broker/in-process duality.
//!
//! ## Design
//!
//! - One named FIFO queue per worker kind, one consumer per queue
//! - Bounded retries with exponential backoff; jobs past the cap are dropped
//!   and logged
//! - Durable backend on Redis (feature `redis`); in-process fallback when no
//!   broker is configured or it cannot be reached at startup
//! - The backend is chosen once in [`JobQueue::connect`] and never swapped
//!
//! ## Components
//!
//! - `Job`: payload plus attempt bookkeeping
//! - `JobHandler`: consumer callback for one queue
//! - `JobQueue`: enqueue / register_consumer / health / shutdown facade

mod executor;
mod memory;
mod queue;
#[cfg(feature = "redis")]
mod redis;
mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

pub use executor::{ConsumerOptions, JobHandler, RateLimit, handler_fn};
pub use queue::{JobQueue, QueueSettings};
pub use types::{
    BackoffStrategy, EnqueueOptions, FailureDisposition, Job, JobId, JobResult, RetryPolicy,
};

/// Well-known queue names.
pub mod queues {
    pub const WEBHOOK_DELIVERY: &str = "webhook-delivery";
    pub const EMAIL: &str = "email";
    pub const ORDER_PROCESSING: &str = "order-processing";
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The broker was selected at startup but is no longer reachable.
    #[error("message broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue '{0}' already has a consumer")]
    ConsumerAlreadyRegistered(String),

    #[error("job queue is shut down")]
    Closed,
}

/// Which backend a [`JobQueue`] runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Redis => "redis",
            BackendKind::Memory => "memory",
        }
    }
}

/// Job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Ready to run
    pub waiting: u64,
    /// Parked until their retry backoff elapses
    pub delayed: u64,
    /// Dropped after exhausting their attempts
    pub failed: u64,
}

/// Snapshot reported by [`JobQueue::health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub backend: BackendKind,
    pub broker_connected: bool,
    pub queues: BTreeMap<String, QueueDepth>,
}

/// Storage and delivery mechanics behind a [`JobQueue`].
#[async_trait]
pub(crate) trait QueueBackend: Send + Sync + 'static {
    fn kind(&self) -> BackendKind;

    async fn push(&self, job: Job) -> Result<(), QueueError>;

    async fn start_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumerOptions,
    ) -> Result<(), QueueError>;

    async fn depths(&self) -> Result<BTreeMap<String, QueueDepth>, QueueError>;

    async fn is_connected(&self) -> bool;

    async fn shutdown(&self);
}
