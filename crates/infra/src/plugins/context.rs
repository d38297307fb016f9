use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use storefront_hooks::{HookFailure, HookManager, HookValue};

use super::PluginError;
use crate::resources::{ResourceError, ResourceKind, ResourceServices};
use crate::store::{LogLevel, PluginLogEntry, PluginStore};

/// Handle given to plugin code, scoped to one plugin id.
///
/// Config and settings reads and writes go through the plugin store; log calls
/// emit a tracing event and append a persisted log row.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: Arc<str>,
    store: Arc<dyn PluginStore>,
    resources: Arc<dyn ResourceServices>,
    hooks: Arc<HookManager>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.plugin_id)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    pub(crate) fn new(
        plugin_id: &str,
        store: Arc<dyn PluginStore>,
        resources: Arc<dyn ResourceServices>,
        hooks: Arc<HookManager>,
    ) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
            store,
            resources,
            hooks,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// The plugin's whole config object.
    pub async fn config(&self) -> Result<serde_json::Map<String, Value>, PluginError> {
        let record = self
            .store
            .get_plugin(&self.plugin_id)
            .await?
            .ok_or_else(|| PluginError::NotInstalled(self.plugin_id.to_string()))?;
        Ok(match record.config {
            Value::Object(map) => map,
            _ => serde_json::Map::new(),
        })
    }

    pub async fn get_config(&self, key: &str) -> Result<Option<Value>, PluginError> {
        Ok(self.config().await?.remove(key))
    }

    pub async fn set_config(&self, key: &str, value: Value) -> Result<(), PluginError> {
        let mut record = self
            .store
            .get_plugin(&self.plugin_id)
            .await?
            .ok_or_else(|| PluginError::NotInstalled(self.plugin_id.to_string()))?;
        if !record.config.is_object() {
            record.config = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut record.config {
            map.insert(key.to_string(), value);
        }
        self.store.save_plugin(&record).await?;
        Ok(())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<Value>, PluginError> {
        Ok(self.store.get_setting(&self.plugin_id, key).await?)
    }

    pub async fn set_setting(&self, key: &str, value: Value) -> Result<(), PluginError> {
        Ok(self.store.set_setting(&self.plugin_id, key, value).await?)
    }

    /// Emit a tracing event and persist a log row. Persistence failures are
    /// logged, never returned.
    pub async fn log(&self, level: LogLevel, message: &str, context: Option<Value>) {
        let plugin_id = &*self.plugin_id;
        match level {
            LogLevel::Debug => debug!(plugin_id, ?context, "{message}"),
            LogLevel::Info => info!(plugin_id, ?context, "{message}"),
            LogLevel::Warn => warn!(plugin_id, ?context, "{message}"),
            LogLevel::Error => error!(plugin_id, ?context, "{message}"),
        }

        let entry = PluginLogEntry {
            plugin_id: plugin_id.to_string(),
            level,
            message: message.to_string(),
            context,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_log(&entry).await {
            warn!(plugin_id, error = %e, "failed to persist plugin log entry");
        }
    }

    pub async fn debug(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Debug, message, context).await
    }

    pub async fn info(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Info, message, context).await
    }

    pub async fn warn(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Warn, message, context).await
    }

    pub async fn error(&self, message: &str, context: Option<Value>) {
        self.log(LogLevel::Error, message, context).await
    }

    fn exposed(kind: ResourceKind) -> Result<ResourceKind, PluginError> {
        match kind {
            ResourceKind::Products | ResourceKind::Orders | ResourceKind::Customers => Ok(kind),
            ResourceKind::Coupons => Err(ResourceError::Invalid {
                kind,
                message: "not exposed to plugins".into(),
            }
            .into()),
        }
    }

    pub async fn get(&self, kind: ResourceKind, id: i64) -> Result<Option<Value>, PluginError> {
        Ok(self.resources.get(Self::exposed(kind)?, id).await?)
    }

    pub async fn list(&self, kind: ResourceKind, filter: Value) -> Result<Vec<Value>, PluginError> {
        Ok(self.resources.list(Self::exposed(kind)?, filter).await?)
    }

    pub async fn create(&self, kind: ResourceKind, body: Value) -> Result<Value, PluginError> {
        Ok(self.resources.create(Self::exposed(kind)?, body).await?)
    }

    pub async fn update(&self, kind: ResourceKind, id: i64, patch: Value) -> Result<Value, PluginError> {
        Ok(self.resources.update(Self::exposed(kind)?, id, patch).await?)
    }

    pub async fn delete(&self, kind: ResourceKind, id: i64) -> Result<bool, PluginError> {
        Ok(self.resources.delete(Self::exposed(kind)?, id).await?)
    }

    pub fn hooks(&self) -> &HookManager {
        &self.hooks
    }

    pub async fn apply_filter(&self, hook_name: &str, value: HookValue) -> HookValue {
        self.hooks.apply_filter(hook_name, value).await
    }

    pub async fn do_action(&self, hook_name: &str, value: HookValue) -> Vec<HookFailure> {
        self.hooks.do_action(hook_name, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::InMemoryResources;
    use crate::store::{InMemoryStore, PluginRecord, PluginStatus};
    use serde_json::json;

    async fn context(store: Arc<InMemoryStore>) -> PluginContext {
        store
            .save_plugin(&PluginRecord {
                id: "demo".into(),
                name: "Demo".into(),
                version: "1.0.0".into(),
                status: PluginStatus::Installed,
                is_system: false,
                manifest: json!({}),
                config: json!({ "greeting": "hi" }),
                date_installed: Utc::now(),
                date_activated: None,
                last_error: None,
            })
            .await
            .unwrap();
        PluginContext::new(
            "demo",
            store,
            Arc::new(InMemoryResources::new()),
            Arc::new(HookManager::new()),
        )
    }

    #[tokio::test]
    async fn config_round_trips_through_the_record() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context(store.clone()).await;

        assert_eq!(ctx.get_config("greeting").await.unwrap(), Some(json!("hi")));
        ctx.set_config("limit", json!(5)).await.unwrap();

        let record = store.get_plugin("demo").await.unwrap().unwrap();
        assert_eq!(record.config, json!({ "greeting": "hi", "limit": 5 }));
    }

    #[tokio::test]
    async fn log_calls_are_persisted() {
        let store = Arc::new(InMemoryStore::new());
        let ctx = context(store.clone()).await;
        ctx.info("synced", Some(json!({ "count": 3 }))).await;
        ctx.error("boom", None).await;

        let logs = store.logs("demo").await.unwrap();
        let levels: Vec<_> = logs.iter().map(|l| l.level).collect();
        assert_eq!(levels, vec![LogLevel::Info, LogLevel::Error]);
        assert_eq!(logs[0].context, Some(json!({ "count": 3 })));
    }

    #[tokio::test]
    async fn resources_pass_through_except_coupons() {
        let ctx = context(Arc::new(InMemoryStore::new())).await;
        let created = ctx.create(ResourceKind::Products, json!({ "name": "Mug" })).await.unwrap();
        let id = created["id"].as_i64().unwrap();
        assert_eq!(ctx.get(ResourceKind::Products, id).await.unwrap().unwrap()["name"], "Mug");
        assert!(ctx.delete(ResourceKind::Products, id).await.unwrap());

        assert!(matches!(
            ctx.list(ResourceKind::Coupons, json!({})).await,
            Err(PluginError::Resource(ResourceError::Invalid { .. }))
        ));
    }
}
