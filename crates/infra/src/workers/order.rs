use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use storefront_core::{Order, OrderId, OrderStatus};

use super::email::{EmailJob, EmailTemplate};
use crate::jobs::{EnqueueOptions, Job, JobHandler, JobQueue, JobResult, QueueError, queues};
use crate::resources::ResourceServices;
use crate::webhooks::WebhookDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderJobKind {
    Created,
    StatusChanged,
    Cancelled,
    Refunded,
    Updated,
}

/// Body of an `order-processing` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderJob {
    #[serde(rename = "type")]
    pub kind: OrderJobKind,
    pub order_id: OrderId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_status: Option<String>,
}

impl OrderJob {
    pub fn created(order_id: OrderId) -> Self {
        Self::of(OrderJobKind::Created, order_id)
    }

    pub fn status_changed(order_id: OrderId, old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old_status: Some(old.into()),
            new_status: Some(new.into()),
            ..Self::of(OrderJobKind::StatusChanged, order_id)
        }
    }

    pub fn cancelled(order_id: OrderId) -> Self {
        Self::of(OrderJobKind::Cancelled, order_id)
    }

    pub fn refunded(order_id: OrderId) -> Self {
        Self::of(OrderJobKind::Refunded, order_id)
    }

    pub fn updated(order_id: OrderId) -> Self {
        Self::of(OrderJobKind::Updated, order_id)
    }

    fn of(kind: OrderJobKind, order_id: OrderId) -> Self {
        Self {
            kind,
            order_id,
            old_status: None,
            new_status: None,
        }
    }

    /// Enqueue on `order-processing`.
    pub async fn enqueue(&self, queue: &JobQueue) -> Result<(), QueueError> {
        queue
            .enqueue_json(queues::ORDER_PROCESSING, self, EnqueueOptions::default())
            .await
            .map(|_| ())
    }
}

/// Side effects and notifications for one order job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderPlan {
    pub reduce_inventory: bool,
    pub restore_inventory: bool,
    pub increment_coupons: bool,
    pub mark_paying: bool,
    pub topic: &'static str,
    pub email: Option<EmailTemplate>,
}

impl OrderPlan {
    const NOTHING: OrderPlan = OrderPlan {
        reduce_inventory: false,
        restore_inventory: false,
        increment_coupons: false,
        mark_paying: false,
        topic: "order.updated",
        email: None,
    };

    pub fn for_job(job: &OrderJob) -> Self {
        match job.kind {
            OrderJobKind::Created => OrderPlan {
                reduce_inventory: true,
                increment_coupons: true,
                topic: "order.created",
                email: Some(EmailTemplate::NewOrder),
                ..Self::NOTHING
            },
            OrderJobKind::StatusChanged => {
                let status = job.new_status.as_deref().and_then(OrderStatus::parse);
                Self::for_status(status)
            }
            OrderJobKind::Cancelled => Self::for_status(Some(OrderStatus::Cancelled)),
            OrderJobKind::Refunded => Self::for_status(Some(OrderStatus::Refunded)),
            OrderJobKind::Updated => Self::NOTHING,
        }
    }

    fn for_status(status: Option<OrderStatus>) -> Self {
        match status {
            Some(OrderStatus::Completed) => OrderPlan {
                mark_paying: true,
                email: Some(EmailTemplate::Completed),
                ..Self::NOTHING
            },
            Some(s @ (OrderStatus::Cancelled | OrderStatus::Refunded)) => OrderPlan {
                restore_inventory: s.restores_inventory(),
                email: Some(if s == OrderStatus::Cancelled {
                    EmailTemplate::Cancelled
                } else {
                    EmailTemplate::Refunded
                }),
                ..Self::NOTHING
            },
            Some(OrderStatus::Processing) => OrderPlan {
                email: Some(EmailTemplate::Processing),
                ..Self::NOTHING
            },
            Some(OrderStatus::OnHold) => OrderPlan {
                email: Some(EmailTemplate::OnHold),
                ..Self::NOTHING
            },
            _ => Self::NOTHING,
        }
    }
}

/// Consumer of `order-processing`.
///
/// Only loading the order can fail the job. Individual side effects,
/// dispatch, and email enqueue errors are logged and skipped so a retry never
/// moves stock twice.
pub struct OrderWorker {
    resources: Arc<dyn ResourceServices>,
    dispatcher: Arc<WebhookDispatcher>,
    queue: JobQueue,
}

impl OrderWorker {
    pub fn new(resources: Arc<dyn ResourceServices>, dispatcher: Arc<WebhookDispatcher>, queue: JobQueue) -> Self {
        Self {
            resources,
            dispatcher,
            queue,
        }
    }

    async fn apply_side_effects(&self, order: &Order, plan: &OrderPlan) {
        if plan.reduce_inventory || plan.restore_inventory {
            for (product_id, delta) in order.stock_deltas(plan.restore_inventory) {
                if let Err(e) = self.resources.adjust_stock(product_id, delta).await {
                    warn!(order_id = %order.id, product_id = %product_id, delta, error = %e, "stock adjustment failed");
                }
            }
        }

        if plan.increment_coupons {
            for code in &order.coupon_codes {
                if let Err(e) = self.resources.increment_coupon_usage(code).await {
                    warn!(order_id = %order.id, coupon = %code, error = %e, "coupon usage update failed");
                }
            }
        }

        if plan.mark_paying {
            if let Some(customer_id) = order.customer_id {
                if let Err(e) = self.resources.mark_customer_paying(customer_id).await {
                    warn!(order_id = %order.id, customer_id = %customer_id, error = %e, "failed to mark customer paying");
                }
            }
        }
    }

    async fn notify(&self, order: &Order, plan: &OrderPlan) {
        let payload = order.to_payload();
        let (resource, event) = plan.topic.split_once('.').unwrap_or((plan.topic, ""));
        if let Err(e) = self.dispatcher.dispatch(plan.topic, resource, event, &payload).await {
            error!(order_id = %order.id, topic = plan.topic, error = %e, "webhook dispatch failed");
        }

        let Some(template) = plan.email else { return };
        let Some(to) = order.billing_email.as_deref().filter(|e| !e.trim().is_empty()) else {
            info!(order_id = %order.id, template = template.as_str(), "no billing email; skipping notification");
            return;
        };

        let email = EmailJob {
            template,
            to: to.to_string(),
            order_id: Some(order.id),
            subject: template.subject(order.id),
            data: payload,
        };
        if let Err(e) = self
            .queue
            .enqueue_json(queues::EMAIL, &email, EnqueueOptions::default())
            .await
        {
            error!(order_id = %order.id, template = template.as_str(), error = %e, "failed to enqueue email");
        }
    }
}

#[async_trait]
impl JobHandler for OrderWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let order_job: OrderJob = match job.payload_as() {
            Ok(body) => body,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "malformed order job");
                return JobResult::Discard(format!("malformed payload: {e}"));
            }
        };

        let order = match self.resources.get_order(order_job.order_id).await {
            Ok(Some(order)) => order,
            Ok(None) => {
                return JobResult::Discard(format!("order {} not found", order_job.order_id));
            }
            Err(e) => return JobResult::Failure(e.to_string()),
        };

        let plan = OrderPlan::for_job(&order_job);
        self.apply_side_effects(&order, &plan).await;
        self.notify(&order, &plan).await;

        info!(
            order_id = %order.id,
            kind = ?order_job.kind,
            topic = plan.topic,
            email = plan.email.map(|t| t.as_str()),
            "order job processed"
        );
        JobResult::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RetryPolicy;
    use crate::resources::{InMemoryResources, ResourceKind};
    use crate::store::{InMemoryStore, WebhookStore, WebhookSubscription};
    use crate::webhooks::{TransportResponse, WebhookTransport};
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use storefront_core::{CustomerId, LineItem, ProductId, WebhookId};

    struct NullTransport;

    #[async_trait]
    impl WebhookTransport for NullTransport {
        async fn post(
            &self,
            _url: &str,
            _headers: &BTreeMap<String, String>,
            _body: Vec<u8>,
        ) -> Result<TransportResponse, String> {
            Ok(TransportResponse {
                status: 200,
                body: String::new(),
            })
        }
    }

    struct Fixture {
        resources: Arc<InMemoryResources>,
        store: Arc<InMemoryStore>,
        queue: JobQueue,
        worker: OrderWorker,
    }

    async fn fixture(status: OrderStatus) -> Fixture {
        let resources = Arc::new(InMemoryResources::new());
        resources.seed(ResourceKind::Products, 1, json!({ "stock_quantity": 10 }));
        resources.seed(ResourceKind::Coupons, 5, json!({ "code": "SAVE10", "usage_count": 0 }));
        resources.seed(ResourceKind::Customers, 9, json!({ "is_paying_customer": false }));
        resources.seed_order(&Order {
            id: OrderId::new(100),
            status,
            customer_id: Some(CustomerId::new(9)),
            billing_email: Some("buyer@example.com".into()),
            line_items: vec![LineItem {
                product_id: ProductId::new(1),
                quantity: 3,
            }],
            coupon_codes: vec!["SAVE10".into()],
            total: 4500,
            created_at: Utc::now(),
        });

        let store = Arc::new(InMemoryStore::new());
        for (id, topic) in [(1, "order.created"), (2, "order.updated")] {
            store
                .save_subscription(&WebhookSubscription::new(
                    WebhookId::new(id),
                    topic,
                    topic,
                    "http://subscriber.test",
                    "secret",
                ))
                .await
                .unwrap();
        }

        let queue = JobQueue::in_memory(RetryPolicy::default());
        let dispatcher = Arc::new(WebhookDispatcher::new(
            store.clone(),
            queue.clone(),
            Arc::new(NullTransport),
            "https://shop.example",
        ));
        let worker = OrderWorker::new(resources.clone(), dispatcher, queue.clone());
        Fixture {
            resources,
            store,
            queue,
            worker,
        }
    }

    fn job(body: &OrderJob) -> Job {
        Job::new(queues::ORDER_PROCESSING, serde_json::to_value(body).unwrap(), RetryPolicy::default())
    }

    async fn stock(res: &InMemoryResources) -> i64 {
        res.get(ResourceKind::Products, 1).await.unwrap().unwrap()["stock_quantity"]
            .as_i64()
            .unwrap()
    }

    #[test]
    fn plan_table() {
        let id = OrderId::new(1);
        let created = OrderPlan::for_job(&OrderJob::created(id));
        assert!(created.reduce_inventory && created.increment_coupons);
        assert_eq!(created.topic, "order.created");
        assert_eq!(created.email, Some(EmailTemplate::NewOrder));

        let completed = OrderPlan::for_job(&OrderJob::status_changed(id, "processing", "completed"));
        assert!(completed.mark_paying && !completed.restore_inventory);
        assert_eq!(completed.email, Some(EmailTemplate::Completed));

        for plan in [
            OrderPlan::for_job(&OrderJob::status_changed(id, "processing", "cancelled")),
            OrderPlan::for_job(&OrderJob::cancelled(id)),
        ] {
            assert!(plan.restore_inventory);
            assert_eq!(plan.topic, "order.updated");
            assert_eq!(plan.email, Some(EmailTemplate::Cancelled));
        }

        let refunded = OrderPlan::for_job(&OrderJob::refunded(id));
        assert!(refunded.restore_inventory);
        assert_eq!(refunded.email, Some(EmailTemplate::Refunded));

        let on_hold = OrderPlan::for_job(&OrderJob::status_changed(id, "pending", "on-hold"));
        assert_eq!(on_hold.email, Some(EmailTemplate::OnHold));

        let other = OrderPlan::for_job(&OrderJob::status_changed(id, "pending", "failed"));
        assert_eq!(other, OrderPlan::NOTHING);
        assert_eq!(OrderPlan::for_job(&OrderJob::updated(id)), OrderPlan::NOTHING);
    }

    #[test]
    fn job_wire_format() {
        let body = serde_json::to_value(OrderJob::status_changed(OrderId::new(3), "pending", "processing")).unwrap();
        assert_eq!(
            body,
            json!({ "type": "status_changed", "orderId": 3, "oldStatus": "pending", "newStatus": "processing" })
        );
    }

    #[tokio::test]
    async fn created_reserves_stock_counts_coupon_and_notifies() {
        let fx = fixture(OrderStatus::Processing).await;
        let result = fx.worker.handle(&job(&OrderJob::created(OrderId::new(100)))).await;
        assert_eq!(result, JobResult::Success);

        assert_eq!(stock(&fx.resources).await, 7);
        let coupon = fx.resources.get(ResourceKind::Coupons, 5).await.unwrap().unwrap();
        assert_eq!(coupon["usage_count"], 1);

        assert_eq!(fx.store.deliveries_for(WebhookId::new(1)).await.unwrap().len(), 1);
        let health = fx.queue.health().await;
        assert_eq!(health.queues[queues::EMAIL].waiting, 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_restores_stock_and_sends_cancelled_email() {
        for body in [
            OrderJob::status_changed(OrderId::new(100), "processing", "cancelled"),
            OrderJob::cancelled(OrderId::new(100)),
        ] {
            let fx = fixture(OrderStatus::Cancelled).await;
            assert_eq!(fx.worker.handle(&job(&body)).await, JobResult::Success);

            assert_eq!(stock(&fx.resources).await, 13);
            assert_eq!(fx.store.deliveries_for(WebhookId::new(2)).await.unwrap().len(), 1);
            assert!(fx.store.deliveries_for(WebhookId::new(1)).await.unwrap().is_empty());
            assert_eq!(fx.queue.health().await.queues[queues::EMAIL].waiting, 1);
            fx.queue.shutdown().await;
        }
    }

    #[tokio::test]
    async fn processing_only_dispatches_and_emails() {
        let fx = fixture(OrderStatus::Processing).await;
        let body = OrderJob::status_changed(OrderId::new(100), "pending", "processing");
        assert_eq!(fx.worker.handle(&job(&body)).await, JobResult::Success);

        assert_eq!(stock(&fx.resources).await, 10);
        let customer = fx.resources.get(ResourceKind::Customers, 9).await.unwrap().unwrap();
        assert_eq!(customer["is_paying_customer"], false);
        assert_eq!(fx.store.deliveries_for(WebhookId::new(2)).await.unwrap().len(), 1);
        assert_eq!(fx.queue.health().await.queues[queues::EMAIL].waiting, 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn completed_marks_customer_paying() {
        let fx = fixture(OrderStatus::Completed).await;
        let body = OrderJob::status_changed(OrderId::new(100), "processing", "completed");
        assert_eq!(fx.worker.handle(&job(&body)).await, JobResult::Success);

        let customer = fx.resources.get(ResourceKind::Customers, 9).await.unwrap().unwrap();
        assert_eq!(customer["is_paying_customer"], true);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn missing_order_is_discarded() {
        let fx = fixture(OrderStatus::Pending).await;
        let result = fx.worker.handle(&job(&OrderJob::updated(OrderId::new(404)))).await;
        assert!(matches!(result, JobResult::Discard(_)));
    }
}
