use serde::Serialize;
use tracing::warn;

use crate::jobs::{BackendKind, JobQueue, QueueHealth};
use crate::plugins::{PluginCounts, PluginManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub queue: QueueHealth,
    pub plugins: PluginCounts,
}

impl HealthReport {
    /// `degraded` when the broker behind a durable queue is unreachable or the
    /// plugin store cannot be read. The in-memory queue alone is not degraded.
    pub async fn collect(queue: &JobQueue, plugins: &PluginManager) -> Self {
        let queue = queue.health().await;
        let mut status = if queue.backend == BackendKind::Redis && !queue.broker_connected {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };

        let plugins = match plugins.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!(error = %e, "failed to count plugins");
                status = HealthStatus::Degraded;
                PluginCounts::default()
            }
        };

        Self { status, queue, plugins }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{EnqueueOptions, RetryPolicy};
    use crate::resources::InMemoryResources;
    use crate::scheduler::Scheduler;
    use crate::store::InMemoryStore;
    use std::sync::Arc;
    use storefront_hooks::HookManager;

    #[tokio::test]
    async fn memory_backend_reports_ok_with_wire_shape() {
        let store = Arc::new(InMemoryStore::new());
        let manager = PluginManager::new(
            store.clone(),
            Arc::new(InMemoryResources::new()),
            Arc::new(HookManager::new()),
            Scheduler::new(store),
        );
        let queue = JobQueue::in_memory(RetryPolicy::default());
        queue.enqueue("email", serde_json::json!({}), EnqueueOptions::default()).await.unwrap();

        let report = HealthReport::collect(&queue, &manager).await;
        assert_eq!(report.status, HealthStatus::Ok);

        let body = serde_json::to_value(&report).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["queue"]["backend"], "memory");
        assert_eq!(body["queue"]["brokerConnected"], false);
        assert_eq!(body["queue"]["queues"]["email"]["waiting"], 1);
        assert_eq!(body["plugins"], serde_json::json!({ "active": 0, "total": 0 }));
        queue.shutdown().await;
    }
}
