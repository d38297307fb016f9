use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use crate::jobs::{Job, JobHandler, JobResult};
use crate::webhooks::{DeliveryJob, WebhookDispatcher};

/// Consumer of `webhook-delivery`: one [`WebhookDispatcher::deliver`] per job.
///
/// A `false` delivery becomes a job failure so the queue's backoff schedules
/// the next attempt.
pub struct WebhookWorker {
    dispatcher: Arc<WebhookDispatcher>,
}

impl WebhookWorker {
    pub fn new(dispatcher: Arc<WebhookDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl JobHandler for WebhookWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let body: DeliveryJob = match job.payload_as() {
            Ok(body) => body,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "malformed webhook delivery job");
                return JobResult::Discard(format!("malformed payload: {e}"));
            }
        };

        if self.dispatcher.deliver(body.delivery_id).await {
            JobResult::Success
        } else {
            JobResult::Failure(format!("delivery {} failed", body.delivery_id))
        }
    }
}
