//! Persistence for webhook, plugin, and schedule state.
//!
//! Each concern has its own trait so components only see the rows they own.
//! [`InMemoryStore`] implements all three for dev and tests;
//! [`PostgresStore`] is the durable implementation.

mod memory;
mod postgres;
mod records;

use async_trait::async_trait;

use storefront_core::{DeliveryId, WebhookId};

pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use records::{
    DeliveryStatus, LogLevel, PluginLogEntry, PluginRecord, PluginStatus, ScheduledTaskRecord,
    WebhookDelivery, WebhookStatus, WebhookSubscription,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error in {operation}: {message}")]
    Database { operation: &'static str, message: String },

    #[error("corrupt row in {table}: {message}")]
    Decode { table: &'static str, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait WebhookStore: Send + Sync {
    /// Subscriptions for `topic` that are `active` and not deleted.
    async fn active_subscriptions(&self, topic: &str) -> StoreResult<Vec<WebhookSubscription>>;

    async fn get_subscription(&self, id: WebhookId) -> StoreResult<Option<WebhookSubscription>>;

    async fn save_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()>;

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()>;

    async fn get_delivery(&self, id: DeliveryId) -> StoreResult<Option<WebhookDelivery>>;

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()>;

    /// Deliveries for one subscription, oldest first.
    async fn deliveries_for(&self, webhook_id: WebhookId) -> StoreResult<Vec<WebhookDelivery>>;
}

#[async_trait]
pub trait PluginStore: Send + Sync {
    async fn get_plugin(&self, id: &str) -> StoreResult<Option<PluginRecord>>;

    async fn list_plugins(&self) -> StoreResult<Vec<PluginRecord>>;

    async fn save_plugin(&self, record: &PluginRecord) -> StoreResult<()>;

    /// Remove the plugin row together with its settings and log entries.
    async fn delete_plugin(&self, id: &str) -> StoreResult<()>;

    async fn get_setting(&self, plugin_id: &str, key: &str) -> StoreResult<Option<serde_json::Value>>;

    async fn set_setting(&self, plugin_id: &str, key: &str, value: serde_json::Value) -> StoreResult<()>;

    async fn append_log(&self, entry: &PluginLogEntry) -> StoreResult<()>;

    async fn logs(&self, plugin_id: &str) -> StoreResult<Vec<PluginLogEntry>>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn get_task(&self, id: &str) -> StoreResult<Option<ScheduledTaskRecord>>;

    /// Upsert keyed by `(plugin_id, schedule_id)`.
    async fn save_task(&self, task: &ScheduledTaskRecord) -> StoreResult<()>;

    async fn delete_plugin_tasks(&self, plugin_id: &str) -> StoreResult<u64>;

    async fn list_tasks(&self) -> StoreResult<Vec<ScheduledTaskRecord>>;
}
