use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::executor::{ConsumerOptions, JobHandler};
use super::memory::MemoryBackend;
use super::types::{EnqueueOptions, Job, JobId, RetryPolicy};
use super::{BackendKind, QueueBackend, QueueError, QueueHealth};

/// Settings resolved once when the queue is constructed.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Broker URL; `None` selects the in-process fallback
    pub redis_url: Option<String>,
    /// Prefix for every broker key
    pub key_prefix: String,
    /// Retry policy applied when an enqueue does not override it
    pub default_retry: RetryPolicy,
    /// How often idle broker consumers poll for work
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: "storefront:".to_string(),
            default_retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(200),
        }
    }
}

/// Named-queue facade over the durable or in-process backend.
///
/// Cheap to clone; all clones share one backend.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    default_retry: RetryPolicy,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("backend", &self.backend.kind())
            .field("default_retry", &self.default_retry)
            .finish()
    }
}

impl JobQueue {
    /// In-process queue; jobs are lost when the process exits.
    pub fn in_memory(default_retry: RetryPolicy) -> Self {
        Self {
            backend: Arc::new(MemoryBackend::new()),
            default_retry,
        }
    }

    /// Pick the backend for the lifetime of the process.
    ///
    /// A configured but unreachable broker degrades to the in-process queue
    /// with a single warning.
    pub async fn connect(settings: QueueSettings) -> Self {
        let Some(url) = settings.redis_url.as_deref() else {
            info!("no broker configured; using in-memory job queue");
            return Self::in_memory(settings.default_retry);
        };

        #[cfg(feature = "redis")]
        {
            return match super::redis::RedisBackend::connect(url, &settings.key_prefix, settings.poll_interval)
                .await
            {
                Ok(backend) => {
                    info!("connected to redis job broker");
                    Self {
                        backend: Arc::new(backend),
                        default_retry: settings.default_retry,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "redis unavailable; falling back to in-memory job queue");
                    Self::in_memory(settings.default_retry)
                }
            };
        }

        #[cfg(not(feature = "redis"))]
        {
            let _ = url;
            warn!("broker configured but redis support is not compiled in; using in-memory job queue");
            Self::in_memory(settings.default_retry)
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn default_retry(&self) -> &RetryPolicy {
        &self.default_retry
    }

    /// Enqueue a job for the consumer of `queue`.
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let job = Job::new(queue, payload, options.resolve(&self.default_retry));
        let id = job.id;
        self.backend.push(job).await?;
        Ok(id)
    }

    /// Serialize `body` and enqueue it.
    pub async fn enqueue_json<T: Serialize>(
        &self,
        queue: &str,
        body: &T,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        self.enqueue(queue, serde_json::to_value(body)?, options).await
    }

    /// Attach the single consumer for `queue`.
    ///
    /// Concurrency and rate limits apply to the durable backend; the
    /// in-process queue always runs one job at a time.
    pub async fn register_consumer(
        &self,
        queue: &str,
        handler: Arc<dyn JobHandler>,
        options: ConsumerOptions,
    ) -> Result<(), QueueError> {
        self.backend.start_consumer(queue, handler, options).await
    }

    pub async fn health(&self) -> QueueHealth {
        let queues = match self.backend.depths().await {
            Ok(queues) => queues,
            Err(e) => {
                warn!(error = %e, "failed to read queue depths");
                Default::default()
            }
        };
        QueueHealth {
            backend: self.backend.kind(),
            broker_connected: self.backend.is_connected().await,
            queues,
        }
    }

    /// Stop consumers and timers; later enqueues fail with [`QueueError::Closed`].
    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobResult, handler_fn};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn no_url_selects_memory_backend() {
        let queue = JobQueue::connect(QueueSettings::default()).await;
        assert_eq!(queue.backend_kind(), BackendKind::Memory);
        assert!(!queue.health().await.broker_connected);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_broker_falls_back_to_memory() {
        let queue = JobQueue::connect(QueueSettings {
            redis_url: Some("redis://127.0.0.1:1/".into()),
            ..Default::default()
        })
        .await;
        assert_eq!(queue.backend_kind(), BackendKind::Memory);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn enqueued_jobs_reach_the_consumer() {
        let queue = JobQueue::in_memory(RetryPolicy::default());
        let hits = Arc::new(AtomicU32::new(0));

        let counter = hits.clone();
        queue
            .register_consumer(
                "email",
                handler_fn(move |job: Job| {
                    let counter = counter.clone();
                    async move {
                        assert_eq!(job.payload["template"], "new_order");
                        counter.fetch_add(1, Ordering::SeqCst);
                        JobResult::Success
                    }
                }),
                ConsumerOptions::default(),
            )
            .await
            .unwrap();

        queue
            .enqueue("email", serde_json::json!({"template": "new_order"}), EnqueueOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let health = queue.health().await;
        assert_eq!(health.backend, BackendKind::Memory);
        assert_eq!(health.queues["email"].waiting, 0);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_an_error() {
        let queue = JobQueue::in_memory(RetryPolicy::default());
        queue.shutdown().await;
        let err = queue
            .enqueue("email", serde_json::json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Closed));
    }
}
