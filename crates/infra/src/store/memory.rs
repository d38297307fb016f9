use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use storefront_core::{DeliveryId, WebhookId};

use super::{
    PluginLogEntry, PluginRecord, PluginStore, ScheduleStore, ScheduledTaskRecord, StoreResult,
    WebhookDelivery, WebhookStore, WebhookSubscription,
};

/// Process-local store for every persisted concern.
///
/// Intended for development and tests. Each mutation is a single-row upsert,
/// matching what the Postgres store does.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    subscriptions: RwLock<BTreeMap<WebhookId, WebhookSubscription>>,
    deliveries: RwLock<HashMap<DeliveryId, WebhookDelivery>>,
    plugins: RwLock<BTreeMap<String, PluginRecord>>,
    settings: RwLock<HashMap<(String, String), serde_json::Value>>,
    logs: RwLock<Vec<PluginLogEntry>>,
    tasks: RwLock<BTreeMap<String, ScheduledTaskRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl WebhookStore for InMemoryStore {
    async fn active_subscriptions(&self, topic: &str) -> StoreResult<Vec<WebhookSubscription>> {
        Ok(read(&self.subscriptions)
            .values()
            .filter(|s| s.topic == topic && s.receives_deliveries())
            .cloned()
            .collect())
    }

    async fn get_subscription(&self, id: WebhookId) -> StoreResult<Option<WebhookSubscription>> {
        Ok(read(&self.subscriptions).get(&id).cloned())
    }

    async fn save_subscription(&self, subscription: &WebhookSubscription) -> StoreResult<()> {
        write(&self.subscriptions).insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        write(&self.deliveries).insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn get_delivery(&self, id: DeliveryId) -> StoreResult<Option<WebhookDelivery>> {
        Ok(read(&self.deliveries).get(&id).cloned())
    }

    async fn update_delivery(&self, delivery: &WebhookDelivery) -> StoreResult<()> {
        write(&self.deliveries).insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn deliveries_for(&self, webhook_id: WebhookId) -> StoreResult<Vec<WebhookDelivery>> {
        let mut rows: Vec<WebhookDelivery> = read(&self.deliveries)
            .values()
            .filter(|d| d.webhook_id == webhook_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| (d.created_at, *d.id.as_uuid()));
        Ok(rows)
    }
}

#[async_trait]
impl PluginStore for InMemoryStore {
    async fn get_plugin(&self, id: &str) -> StoreResult<Option<PluginRecord>> {
        Ok(read(&self.plugins).get(id).cloned())
    }

    async fn list_plugins(&self) -> StoreResult<Vec<PluginRecord>> {
        Ok(read(&self.plugins).values().cloned().collect())
    }

    async fn save_plugin(&self, record: &PluginRecord) -> StoreResult<()> {
        write(&self.plugins).insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_plugin(&self, id: &str) -> StoreResult<()> {
        write(&self.plugins).remove(id);
        write(&self.settings).retain(|(plugin, _), _| plugin != id);
        write(&self.logs).retain(|entry| entry.plugin_id != id);
        Ok(())
    }

    async fn get_setting(&self, plugin_id: &str, key: &str) -> StoreResult<Option<serde_json::Value>> {
        Ok(read(&self.settings)
            .get(&(plugin_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn set_setting(&self, plugin_id: &str, key: &str, value: serde_json::Value) -> StoreResult<()> {
        write(&self.settings).insert((plugin_id.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn append_log(&self, entry: &PluginLogEntry) -> StoreResult<()> {
        write(&self.logs).push(entry.clone());
        Ok(())
    }

    async fn logs(&self, plugin_id: &str) -> StoreResult<Vec<PluginLogEntry>> {
        Ok(read(&self.logs)
            .iter()
            .filter(|entry| entry.plugin_id == plugin_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ScheduleStore for InMemoryStore {
    async fn get_task(&self, id: &str) -> StoreResult<Option<ScheduledTaskRecord>> {
        Ok(read(&self.tasks).get(id).cloned())
    }

    async fn save_task(&self, task: &ScheduledTaskRecord) -> StoreResult<()> {
        write(&self.tasks).insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn delete_plugin_tasks(&self, plugin_id: &str) -> StoreResult<u64> {
        let mut tasks = write(&self.tasks);
        let before = tasks.len();
        tasks.retain(|_, task| task.plugin_id != plugin_id);
        Ok((before - tasks.len()) as u64)
    }

    async fn list_tasks(&self) -> StoreResult<Vec<ScheduledTaskRecord>> {
        Ok(read(&self.tasks).values().cloned().collect())
    }
}
