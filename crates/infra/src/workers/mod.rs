//! Queue consumers: webhook delivery, email, and order processing.
//!
//! Each worker is an independent [`JobHandler`](crate::jobs::JobHandler) for
//! one named queue with its own concurrency.

mod email;
mod order;
mod webhook;

use std::sync::Arc;

pub use email::{EmailJob, EmailMessage, EmailTemplate, EmailWorker, LogMailer, Mailer};
pub use order::{OrderJob, OrderJobKind, OrderPlan, OrderWorker};
pub use webhook::WebhookWorker;

use crate::config::CoreConfig;
use crate::jobs::{ConsumerOptions, JobQueue, QueueError, queues};
use crate::resources::ResourceServices;
use crate::webhooks::WebhookDispatcher;

/// Dependencies shared by the workers.
pub struct WorkerDeps {
    pub dispatcher: Arc<WebhookDispatcher>,
    pub resources: Arc<dyn ResourceServices>,
    pub mailer: Arc<dyn Mailer>,
}

/// Attach all three workers to `queue`.
pub async fn register_workers(
    queue: &JobQueue,
    deps: WorkerDeps,
    config: &CoreConfig,
) -> Result<(), QueueError> {
    let mut webhook_options = ConsumerOptions::default().with_concurrency(config.webhook_concurrency);
    if let Some(rate) = config.webhook_rate() {
        webhook_options = webhook_options.with_rate_limit(rate);
    }

    queue
        .register_consumer(
            queues::WEBHOOK_DELIVERY,
            Arc::new(WebhookWorker::new(deps.dispatcher.clone())),
            webhook_options,
        )
        .await?;

    queue
        .register_consumer(
            queues::EMAIL,
            Arc::new(EmailWorker::new(deps.mailer)),
            ConsumerOptions::default().with_concurrency(config.email_concurrency),
        )
        .await?;

    queue
        .register_consumer(
            queues::ORDER_PROCESSING,
            Arc::new(OrderWorker::new(deps.resources, deps.dispatcher, queue.clone())),
            ConsumerOptions::default().with_concurrency(config.order_concurrency),
        )
        .await?;

    Ok(())
}
