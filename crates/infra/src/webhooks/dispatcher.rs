use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use storefront_core::DeliveryId;

use super::signature::sign;
use super::transport::WebhookTransport;
use super::WebhookError;
use crate::jobs::{EnqueueOptions, JobQueue, queues};
use crate::store::{DeliveryStatus, WebhookDelivery, WebhookStore, WebhookSubscription};

/// Header names sent with every delivery.
pub mod headers {
    pub const SOURCE: &str = "X-WC-Webhook-Source";
    pub const TOPIC: &str = "X-WC-Webhook-Topic";
    pub const RESOURCE: &str = "X-WC-Webhook-Resource";
    pub const EVENT: &str = "X-WC-Webhook-Event";
    pub const SIGNATURE: &str = "X-WC-Webhook-Signature";
    pub const ID: &str = "X-WC-Webhook-ID";
    pub const DELIVERY_ID: &str = "X-WC-Webhook-Delivery-ID";
    pub const CONTENT_TYPE: &str = "Content-Type";
}

/// Body of a `webhook-delivery` job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    pub delivery_id: DeliveryId,
}

/// Fans events out to subscribers and performs individual deliveries.
///
/// The dispatcher never retries on its own: a failed [`deliver`] is reported
/// to the job queue, whose backoff drives the next attempt.
///
/// [`deliver`]: WebhookDispatcher::deliver
pub struct WebhookDispatcher {
    store: Arc<dyn WebhookStore>,
    queue: JobQueue,
    transport: Arc<dyn WebhookTransport>,
    site_url: String,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn WebhookStore>,
        queue: JobQueue,
        transport: Arc<dyn WebhookTransport>,
        site_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            transport,
            site_url: site_url.into(),
        }
    }

    /// Create one signed, pending delivery per active subscriber of `topic`
    /// and enqueue a delivery job for each. Returns the number created.
    #[instrument(skip(self, data), err)]
    pub async fn dispatch(
        &self,
        topic: &str,
        resource: &str,
        event: &str,
        data: &serde_json::Value,
    ) -> Result<usize, WebhookError> {
        let subscribers = self.store.active_subscriptions(topic).await?;
        if subscribers.is_empty() {
            debug!(topic, "no active subscribers");
            return Ok(0);
        }

        let body = serde_json::to_vec(data)?;
        let mut created = 0;

        for sub in &subscribers {
            let delivery = self.new_delivery(sub, topic, resource, event, data, &body);
            self.store.insert_delivery(&delivery).await?;
            created += 1;

            let job = DeliveryJob {
                delivery_id: delivery.id,
            };
            if let Err(e) = self
                .queue
                .enqueue_json(queues::WEBHOOK_DELIVERY, &job, EnqueueOptions::default())
                .await
            {
                error!(
                    topic,
                    webhook_id = %sub.id,
                    delivery_id = %delivery.id,
                    error = %e,
                    "failed to enqueue webhook delivery"
                );
            }
        }

        info!(topic, deliveries = created, "webhook dispatched");
        Ok(created)
    }

    fn new_delivery(
        &self,
        sub: &WebhookSubscription,
        topic: &str,
        resource: &str,
        event: &str,
        data: &serde_json::Value,
        body: &[u8],
    ) -> WebhookDelivery {
        let id = DeliveryId::new();
        let request_headers = BTreeMap::from([
            (headers::CONTENT_TYPE.to_string(), "application/json".to_string()),
            (headers::SOURCE.to_string(), self.site_url.clone()),
            (headers::TOPIC.to_string(), topic.to_string()),
            (headers::RESOURCE.to_string(), resource.to_string()),
            (headers::EVENT.to_string(), event.to_string()),
            (headers::SIGNATURE.to_string(), sign(body, &sub.secret)),
            (headers::ID.to_string(), sub.id.to_string()),
            (headers::DELIVERY_ID.to_string(), id.to_string()),
        ]);

        WebhookDelivery {
            id,
            webhook_id: sub.id,
            topic: topic.to_string(),
            status: DeliveryStatus::Pending,
            request_body: data.clone(),
            request_headers,
            response_code: None,
            response_body: None,
            error_message: None,
            retry_count: 0,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// POST one delivery and record the outcome on its row.
    ///
    /// Returns `true` when the subscriber answered 2xx (or already had). Every
    /// `false` bumps `retry_count` exactly once.
    #[instrument(skip(self), fields(delivery_id = %delivery_id))]
    pub async fn deliver(&self, delivery_id: DeliveryId) -> bool {
        let mut delivery = match self.store.get_delivery(delivery_id).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                warn!("webhook delivery not found");
                return false;
            }
            Err(e) => {
                error!(error = %e, "failed to load webhook delivery");
                return false;
            }
        };

        if delivery.status == DeliveryStatus::Delivered {
            debug!("webhook delivery already delivered");
            return true;
        }

        let subscription = match self.store.get_subscription(delivery.webhook_id).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                warn!(webhook_id = %delivery.webhook_id, "webhook subscription not found");
                return false;
            }
            Err(e) => {
                error!(error = %e, "failed to load webhook subscription");
                return false;
            }
        };

        let body = match serde_json::to_vec(&delivery.request_body) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "failed to encode webhook body");
                return false;
            }
        };

        let outcome = self
            .transport
            .post(&subscription.delivery_url, &delivery.request_headers, body)
            .await;

        delivery.completed_at = Some(Utc::now());
        let delivered = match outcome {
            Ok(resp) if resp.is_success() => {
                delivery.status = DeliveryStatus::Delivered;
                delivery.response_code = Some(resp.status);
                delivery.response_body = Some(resp.body);
                delivery.error_message = None;
                info!(status = resp.status, "webhook delivered");
                true
            }
            Ok(resp) => {
                delivery.status = DeliveryStatus::Failed;
                delivery.response_code = Some(resp.status);
                delivery.response_body = Some(resp.body);
                delivery.error_message = Some(format!("subscriber responded with HTTP {}", resp.status));
                delivery.retry_count += 1;
                warn!(status = resp.status, retry_count = delivery.retry_count, "webhook rejected");
                false
            }
            Err(e) => {
                delivery.status = DeliveryStatus::Failed;
                delivery.response_code = None;
                delivery.error_message = Some(e.clone());
                delivery.retry_count += 1;
                warn!(error = %e, retry_count = delivery.retry_count, "webhook transport failed");
                false
            }
        };

        if let Err(e) = self.store.update_delivery(&delivery).await {
            error!(error = %e, "failed to record webhook delivery outcome");
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{BackendKind, RetryPolicy};
    use crate::store::{InMemoryStore, WebhookStatus};
    use crate::webhooks::{TransportResponse, verify_signature};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use storefront_core::WebhookId;

    /// Records requests and answers with a fixed status (or a transport error).
    struct ScriptedTransport {
        status: Option<u16>,
        requests: Mutex<Vec<(String, BTreeMap<String, String>, Vec<u8>)>>,
    }

    impl ScriptedTransport {
        fn answering(status: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                status,
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WebhookTransport for ScriptedTransport {
        async fn post(
            &self,
            url: &str,
            headers: &BTreeMap<String, String>,
            body: Vec<u8>,
        ) -> Result<TransportResponse, String> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), headers.clone(), body));
            match self.status {
                Some(status) => Ok(TransportResponse {
                    status,
                    body: "ok".into(),
                }),
                None => Err("connection refused".into()),
            }
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        queue: JobQueue,
        transport: Arc<ScriptedTransport>,
        dispatcher: WebhookDispatcher,
    }

    fn fixture(status: Option<u16>) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let queue = JobQueue::in_memory(RetryPolicy::default());
        let transport = ScriptedTransport::answering(status);
        let dispatcher = WebhookDispatcher::new(
            store.clone(),
            queue.clone(),
            transport.clone(),
            "https://shop.example",
        );
        Fixture {
            store,
            queue,
            transport,
            dispatcher,
        }
    }

    async fn subscribe(store: &InMemoryStore, id: i64, topic: &str) -> WebhookSubscription {
        let sub = WebhookSubscription::new(
            WebhookId::new(id),
            format!("hook {id}"),
            topic,
            format!("http://subscriber.test/{id}"),
            "whsec_test",
        );
        store.save_subscription(&sub).await.unwrap();
        sub
    }

    #[tokio::test]
    async fn no_subscribers_creates_nothing() {
        let fx = fixture(Some(200));
        let n = fx
            .dispatcher
            .dispatch("order.created", "order", "created", &serde_json::json!({"id": 1}))
            .await
            .unwrap();
        assert_eq!(n, 0);

        let health = fx.queue.health().await;
        assert_eq!(health.backend, BackendKind::Memory);
        assert!(health.queues.is_empty());
    }

    #[tokio::test]
    async fn dispatch_creates_signed_pending_delivery_and_job() {
        let fx = fixture(Some(200));
        let sub = subscribe(&fx.store, 1, "order.created").await;
        let mut paused = subscribe(&fx.store, 2, "order.created").await;
        paused.status = WebhookStatus::Paused;
        fx.store.save_subscription(&paused).await.unwrap();

        let data = serde_json::json!({"id": 42, "status": "processing"});
        let n = fx
            .dispatcher
            .dispatch("order.created", "order", "created", &data)
            .await
            .unwrap();
        assert_eq!(n, 1);

        let deliveries = fx.store.deliveries_for(sub.id).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        let d = &deliveries[0];
        assert_eq!(d.status, DeliveryStatus::Pending);
        assert_eq!(d.request_headers[headers::TOPIC], "order.created");
        assert_eq!(d.request_headers[headers::RESOURCE], "order");
        assert_eq!(d.request_headers[headers::EVENT], "created");
        assert_eq!(d.request_headers[headers::ID], "1");
        assert_eq!(d.request_headers[headers::SOURCE], "https://shop.example");
        assert_eq!(d.request_headers[headers::DELIVERY_ID], d.id.to_string());

        let body = serde_json::to_vec(&data).unwrap();
        assert!(verify_signature(&body, "whsec_test", &d.request_headers[headers::SIGNATURE]));

        let health = fx.queue.health().await;
        assert_eq!(health.queues[queues::WEBHOOK_DELIVERY].waiting, 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn successful_post_marks_delivered() {
        let fx = fixture(Some(200));
        let sub = subscribe(&fx.store, 1, "order.created").await;
        fx.dispatcher
            .dispatch("order.created", "order", "created", &serde_json::json!({"id": 7}))
            .await
            .unwrap();
        let id = fx.store.deliveries_for(sub.id).await.unwrap()[0].id;

        assert!(fx.dispatcher.deliver(id).await);

        let d = fx.store.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Delivered);
        assert_eq!(d.response_code, Some(200));
        assert!(d.completed_at.is_some());

        let requests = fx.transport.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "http://subscriber.test/1");
        assert_eq!(requests[0].2, br#"{"id":7}"#.to_vec());
        drop(requests);

        // Redelivery of a delivered row is a no-op success.
        assert!(fx.dispatcher.deliver(id).await);
        assert_eq!(fx.transport.requests.lock().unwrap().len(), 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn failures_increment_retry_count_once_each() {
        let fx = fixture(Some(500));
        let sub = subscribe(&fx.store, 1, "order.updated").await;
        fx.dispatcher
            .dispatch("order.updated", "order", "updated", &serde_json::json!({}))
            .await
            .unwrap();
        let id = fx.store.deliveries_for(sub.id).await.unwrap()[0].id;

        assert!(!fx.dispatcher.deliver(id).await);
        assert!(!fx.dispatcher.deliver(id).await);

        let d = fx.store.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(d.status, DeliveryStatus::Failed);
        assert_eq!(d.response_code, Some(500));
        assert_eq!(d.retry_count, 2);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn transport_error_is_recorded() {
        let fx = fixture(None);
        let sub = subscribe(&fx.store, 3, "order.updated").await;
        fx.dispatcher
            .dispatch("order.updated", "order", "updated", &serde_json::json!({}))
            .await
            .unwrap();
        let id = fx.store.deliveries_for(sub.id).await.unwrap()[0].id;

        assert!(!fx.dispatcher.deliver(id).await);
        let d = fx.store.get_delivery(id).await.unwrap().unwrap();
        assert_eq!(d.error_message.as_deref(), Some("connection refused"));
        assert_eq!(d.retry_count, 1);
        fx.queue.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_delivery_is_false() {
        let fx = fixture(Some(200));
        assert!(!fx.dispatcher.deliver(DeliveryId::new()).await);
    }
}
