use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use storefront_core::OrderId;

use crate::jobs::{Job, JobHandler, JobResult};

/// Order notification templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    NewOrder,
    Processing,
    Completed,
    Cancelled,
    Refunded,
    OnHold,
}

impl EmailTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailTemplate::NewOrder => "new_order",
            EmailTemplate::Processing => "processing",
            EmailTemplate::Completed => "completed",
            EmailTemplate::Cancelled => "cancelled",
            EmailTemplate::Refunded => "refunded",
            EmailTemplate::OnHold => "on_hold",
        }
    }

    pub fn subject(&self, order_id: OrderId) -> String {
        match self {
            EmailTemplate::NewOrder => format!("Your order #{order_id} has been received"),
            EmailTemplate::Processing => format!("Your order #{order_id} is being processed"),
            EmailTemplate::Completed => format!("Your order #{order_id} is complete"),
            EmailTemplate::Cancelled => format!("Your order #{order_id} has been cancelled"),
            EmailTemplate::Refunded => format!("Your order #{order_id} has been refunded"),
            EmailTemplate::OnHold => format!("Your order #{order_id} is on hold"),
        }
    }

    fn lead(&self) -> &'static str {
        match self {
            EmailTemplate::NewOrder => "Thank you for your order. We have received it and will let you know when it ships.",
            EmailTemplate::Processing => "Good news: your order is now being processed.",
            EmailTemplate::Completed => "Your order has been completed. Thank you for shopping with us.",
            EmailTemplate::Cancelled => "Your order has been cancelled. Any reserved stock has been released.",
            EmailTemplate::Refunded => "Your order has been refunded.",
            EmailTemplate::OnHold => "Your order is on hold until we confirm payment.",
        }
    }

    /// Plain-text body from the order payload carried in the job.
    pub fn render(&self, data: &serde_json::Value) -> String {
        let mut body = String::from(self.lead());
        body.push_str("\n\n");

        if let Some(id) = data.get("id") {
            body.push_str(&format!("Order: #{id}\n"));
        }
        if let Some(status) = data.get("status").and_then(|s| s.as_str()) {
            body.push_str(&format!("Status: {status}\n"));
        }
        if let Some(items) = data.get("line_items").and_then(|l| l.as_array()) {
            for item in items {
                let product = item.get("product_id").cloned().unwrap_or_default();
                let qty = item.get("quantity").and_then(|q| q.as_i64()).unwrap_or(0);
                body.push_str(&format!("  - product {product} x {qty}\n"));
            }
        }
        if let Some(total) = data.get("total").and_then(|t| t.as_i64()) {
            body.push_str(&format!("Total: {}.{:02}\n", total / 100, (total % 100).abs()));
        }
        body
    }
}

/// Body of an `email` job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailJob {
    pub template: EmailTemplate,
    pub to: String,
    pub order_id: Option<OrderId>,
    pub subject: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A rendered message ready for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()>;
}

/// Mailer that only logs; the default when no transport is configured.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
        info!(to = %message.to, subject = %message.subject, "email sent (log mailer)");
        Ok(())
    }
}

/// Consumer of the `email` queue.
pub struct EmailWorker {
    mailer: Arc<dyn Mailer>,
}

impl EmailWorker {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for EmailWorker {
    async fn handle(&self, job: &Job) -> JobResult {
        let email: EmailJob = match job.payload_as() {
            Ok(email) => email,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "malformed email job");
                return JobResult::Discard(format!("malformed payload: {e}"));
            }
        };

        let message = EmailMessage {
            to: email.to,
            subject: email.subject,
            body: email.template.render(&email.data),
        };

        match self.mailer.send(&message).await {
            Ok(()) => JobResult::Success,
            Err(e) => JobResult::Failure(format!("mail transport: {e:#}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::RetryPolicy;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingMailer {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl Mailer for CapturingMailer {
        async fn send(&self, message: &EmailMessage) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    #[test]
    fn template_names_match_wire_format() {
        let t: EmailTemplate = serde_json::from_str("\"on_hold\"").unwrap();
        assert_eq!(t, EmailTemplate::OnHold);
        assert_eq!(EmailTemplate::NewOrder.as_str(), "new_order");
    }

    #[test]
    fn render_includes_order_details() {
        let body = EmailTemplate::Processing.render(&serde_json::json!({
            "id": 42,
            "status": "processing",
            "line_items": [{ "product_id": 7, "quantity": 2 }],
            "total": 1999
        }));
        assert!(body.starts_with("Good news"));
        assert!(body.contains("Order: #42"));
        assert!(body.contains("product 7 x 2"));
        assert!(body.contains("Total: 19.99"));
    }

    #[tokio::test]
    async fn worker_renders_and_sends() {
        let mailer = Arc::new(CapturingMailer::default());
        let worker = EmailWorker::new(mailer.clone());

        let job = Job::new(
            "email",
            serde_json::to_value(EmailJob {
                template: EmailTemplate::Completed,
                to: "buyer@example.com".into(),
                order_id: Some(OrderId::new(42)),
                subject: EmailTemplate::Completed.subject(OrderId::new(42)),
                data: serde_json::json!({ "id": 42 }),
            })
            .unwrap(),
            RetryPolicy::default(),
        );

        assert_eq!(worker.handle(&job).await, JobResult::Success);
        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].to, "buyer@example.com");
        assert_eq!(sent[0].subject, "Your order #42 is complete");
    }

    #[tokio::test]
    async fn malformed_job_is_discarded() {
        let worker = EmailWorker::new(Arc::new(LogMailer));
        let job = Job::new("email", serde_json::json!({ "template": "nope" }), RetryPolicy::default());
        assert!(matches!(worker.handle(&job).await, JobResult::Discard(_)));
    }
}
