use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use storefront_hooks::HookManager;

use super::{Phase, Plugin, PluginContext, PluginError};
use crate::resources::ResourceServices;
use crate::scheduler::Scheduler;
use crate::store::{PluginRecord, PluginStatus, PluginStore};

/// Plugin totals for health output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PluginCounts {
    pub active: usize,
    pub total: usize,
}

/// Owns every plugin's lifecycle.
///
/// Lifecycle operations are serialized; each one leaves the plugin either in
/// its target state or in `error` with nothing registered.
pub struct PluginManager {
    store: Arc<dyn PluginStore>,
    resources: Arc<dyn ResourceServices>,
    hooks: Arc<HookManager>,
    scheduler: Scheduler,
    registry: RwLock<HashMap<String, Arc<Plugin>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<String> = self.read_registry().keys().cloned().collect();
        f.debug_struct("PluginManager")
            .field("registered", &registered)
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    pub fn new(
        store: Arc<dyn PluginStore>,
        resources: Arc<dyn ResourceServices>,
        hooks: Arc<HookManager>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            store,
            resources,
            hooks,
            scheduler,
            registry: RwLock::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    fn read_registry(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Plugin>>> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_registry(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Plugin>>> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Context handed to `plugin_id`'s code.
    pub fn context(&self, plugin_id: &str) -> PluginContext {
        PluginContext::new(
            plugin_id,
            self.store.clone(),
            self.resources.clone(),
            self.hooks.clone(),
        )
    }

    pub async fn list(&self) -> Result<Vec<PluginRecord>, PluginError> {
        Ok(self.store.list_plugins().await?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<PluginRecord>, PluginError> {
        Ok(self.store.get_plugin(id).await?)
    }

    pub async fn counts(&self) -> Result<PluginCounts, PluginError> {
        let plugins = self.list().await?;
        Ok(PluginCounts {
            active: plugins.iter().filter(|p| p.status == PluginStatus::Active).count(),
            total: plugins.len(),
        })
    }

    /// Register `plugin`, run its install callback and persist it as `installed`
    /// with its default config. A failing callback rolls everything back.
    #[instrument(skip_all, fields(plugin_id = %plugin.id()))]
    pub async fn install(&self, plugin: Plugin) -> Result<PluginRecord, PluginError> {
        let _lifecycle = self.lifecycle.lock().await;
        let id = plugin.id().to_string();
        let registered = self.read_registry().contains_key(&id);
        if registered || self.store.get_plugin(&id).await?.is_some() {
            return Err(PluginError::AlreadyInstalled(id));
        }

        let manifest = plugin.manifest();
        let record = PluginRecord {
            id: id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            status: PluginStatus::Installed,
            is_system: manifest.is_system,
            manifest: serde_json::to_value(manifest).unwrap_or_default(),
            config: serde_json::Value::Object(manifest.default_config.clone()),
            date_installed: Utc::now(),
            date_activated: None,
            last_error: None,
        };

        let plugin = Arc::new(plugin);
        self.write_registry().insert(id.clone(), plugin.clone());
        if let Err(e) = self.store.save_plugin(&record).await {
            self.write_registry().remove(&id);
            return Err(e.into());
        }

        if let Err(e) = self.run_callback(&plugin, Phase::Install).await {
            self.write_registry().remove(&id);
            if let Err(cleanup) = self.store.delete_plugin(&id).await {
                warn!(error = %cleanup, "failed to remove record of rolled-back install");
            }
            warn!(error = %e, "plugin install rolled back");
            return Err(e);
        }

        info!(version = %record.version, "plugin installed");
        Ok(self.store.get_plugin(&id).await?.unwrap_or(record))
    }

    /// Run the activate callback and wire every declared hook and schedule.
    /// Allowed from `installed`, `inactive` and `error`.
    #[instrument(skip(self))]
    pub async fn activate(&self, id: &str) -> Result<PluginRecord, PluginError> {
        let _lifecycle = self.lifecycle.lock().await;
        let plugin = self.plugin(id)?;
        let record = self.record(id).await?;
        if record.status == PluginStatus::Active {
            return Err(PluginError::InvalidTransition {
                id: id.to_string(),
                status: record.status,
                action: Phase::Activate,
            });
        }
        self.activate_locked(&plugin).await
    }

    /// Run the deactivate callback and remove every hook and schedule. The
    /// teardown happens even when the callback fails; the plugin then lands in
    /// `error` and the failure is returned.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, id: &str) -> Result<PluginRecord, PluginError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.deactivate_locked(id).await
    }

    /// Deactivate if needed, run the uninstall callback and hard-delete the
    /// plugin record with its settings and logs.
    #[instrument(skip(self))]
    pub async fn uninstall(&self, id: &str) -> Result<(), PluginError> {
        let _lifecycle = self.lifecycle.lock().await;
        let record = self.store.get_plugin(id).await?;
        let plugin = self.read_registry().get(id).cloned();
        if record.is_none() && plugin.is_none() {
            return Err(PluginError::NotInstalled(id.to_string()));
        }

        if record.as_ref().is_some_and(|r| r.status == PluginStatus::Active) {
            match &plugin {
                Some(_) => {
                    if let Err(e) = self.deactivate_locked(id).await {
                        warn!(error = %e, "deactivate before uninstall failed, continuing");
                    }
                }
                None => self.teardown(id).await,
            }
        }

        if let Some(plugin) = &plugin {
            if let Err(e) = self.run_callback(plugin, Phase::Uninstall).await {
                self.mark_error(id, &e).await;
                return Err(e);
            }
        }

        self.write_registry().remove(id);
        self.store.delete_plugin(id).await?;
        info!("plugin uninstalled");
        Ok(())
    }

    /// Re-register the code for already-installed plugins after a restart and
    /// re-activate those persisted as `active`. Plugins without a record are
    /// skipped; they need an explicit install. Returns how many were restored.
    pub async fn restore(&self, catalog: impl IntoIterator<Item = Plugin>) -> Result<usize, PluginError> {
        let _lifecycle = self.lifecycle.lock().await;
        let mut restored = 0;

        for plugin in catalog {
            let id = plugin.id().to_string();
            let Some(record) = self.store.get_plugin(&id).await? else {
                debug!(plugin_id = %id, "plugin not installed, skipping restore");
                continue;
            };

            let plugin = Arc::new(plugin);
            self.write_registry().insert(id.clone(), plugin.clone());
            restored += 1;

            if record.status == PluginStatus::Active {
                if let Err(e) = self.activate_locked(&plugin).await {
                    warn!(plugin_id = %id, error = %e, "failed to re-activate plugin");
                }
            }
        }

        info!(restored, "plugins restored");
        Ok(restored)
    }

    fn plugin(&self, id: &str) -> Result<Arc<Plugin>, PluginError> {
        self.read_registry()
            .get(id)
            .cloned()
            .ok_or_else(|| PluginError::NotInstalled(id.to_string()))
    }

    async fn record(&self, id: &str) -> Result<PluginRecord, PluginError> {
        self.store
            .get_plugin(id)
            .await?
            .ok_or_else(|| PluginError::NotInstalled(id.to_string()))
    }

    async fn run_callback(&self, plugin: &Plugin, phase: Phase) -> Result<(), PluginError> {
        let Some(callback) = plugin.lifecycle(phase) else {
            return Ok(());
        };
        let failed = |message: String| PluginError::Callback {
            id: plugin.id().to_string(),
            phase,
            message,
        };
        match AssertUnwindSafe(callback.call(self.context(plugin.id()))).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(failed(format!("{e:#}"))),
            Err(_) => Err(failed("callback panicked".to_string())),
        }
    }

    async fn activate_locked(&self, plugin: &Plugin) -> Result<PluginRecord, PluginError> {
        let id = plugin.id();
        let outcome = match self.wire(plugin).await {
            Ok(()) => self.set_status(id, PluginStatus::Active, None).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(record) => {
                info!(
                    plugin_id = id,
                    hooks = plugin.manifest().hooks.len(),
                    schedules = plugin.manifest().schedules.len(),
                    "plugin activated"
                );
                Ok(record)
            }
            Err(e) => {
                self.teardown(id).await;
                self.mark_error(id, &e).await;
                Err(e)
            }
        }
    }

    /// Every declared hook and schedule must have code before anything is
    /// registered.
    async fn wire(&self, plugin: &Plugin) -> Result<(), PluginError> {
        let id = plugin.id();
        let manifest = plugin.manifest();
        let missing = |kind: &'static str, name: &str| PluginError::MissingHandler {
            id: id.to_string(),
            kind,
            name: name.to_string(),
        };

        let hooks = manifest
            .hooks
            .iter()
            .map(|decl| {
                plugin
                    .hook(decl.name())
                    .map(|cb| (decl, cb.clone()))
                    .ok_or_else(|| missing("hook", decl.name()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let schedules = manifest
            .schedules
            .iter()
            .map(|decl| {
                plugin
                    .schedule(&decl.id)
                    .map(|handler| (decl, handler.clone()))
                    .ok_or_else(|| missing("schedule", &decl.id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.run_callback(plugin, Phase::Activate).await?;

        for (decl, callback) in hooks {
            self.hooks.register(decl.name(), id, callback, decl.priority());
        }
        for (decl, handler) in schedules {
            self.scheduler
                .register(id, &decl.id, &decl.schedule, decl.description.clone(), handler)
                .await?;
        }
        Ok(())
    }

    async fn deactivate_locked(&self, id: &str) -> Result<PluginRecord, PluginError> {
        let plugin = self.plugin(id)?;
        let record = self.record(id).await?;
        if record.status != PluginStatus::Active {
            return Err(PluginError::InvalidTransition {
                id: id.to_string(),
                status: record.status,
                action: Phase::Deactivate,
            });
        }

        let callback = self.run_callback(&plugin, Phase::Deactivate).await;
        self.teardown(id).await;

        match callback {
            Ok(()) => {
                let record = self.set_status(id, PluginStatus::Inactive, None).await?;
                info!(plugin_id = id, "plugin deactivated");
                Ok(record)
            }
            Err(e) => {
                self.mark_error(id, &e).await;
                Err(e)
            }
        }
    }

    /// Remove every hook and scheduled task owned by `id`.
    async fn teardown(&self, id: &str) {
        let hooks = self.hooks.unregister_plugin(id);
        match self.scheduler.unregister_plugin(id).await {
            Ok(tasks) => debug!(plugin_id = id, hooks, tasks, "plugin registrations removed"),
            Err(e) => warn!(plugin_id = id, hooks, error = %e, "failed to remove scheduled tasks"),
        }
    }

    async fn set_status(
        &self,
        id: &str,
        status: PluginStatus,
        last_error: Option<String>,
    ) -> Result<PluginRecord, PluginError> {
        let mut record = self.record(id).await?;
        record.status = status;
        record.last_error = last_error;
        if status == PluginStatus::Active {
            record.date_activated = Some(Utc::now());
        }
        self.store.save_plugin(&record).await?;
        Ok(record)
    }

    async fn mark_error(&self, id: &str, error: &PluginError) {
        warn!(plugin_id = id, error = %error, "plugin moved to error state");
        if let Err(e) = self.set_status(id, PluginStatus::Error, Some(error.to_string())).await {
            warn!(plugin_id = id, error = %e, "failed to persist plugin error state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{HookDecl, PluginManifest, ScheduleDecl};
    use crate::resources::InMemoryResources;
    use crate::scheduler::schedule_fn;
    use crate::store::{InMemoryStore, ScheduleStore, ScheduledTaskRecord};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use storefront_hooks::hook_fn;

    struct Harness {
        manager: PluginManager,
        store: Arc<InMemoryStore>,
        hooks: Arc<HookManager>,
        scheduler: Scheduler,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let hooks = Arc::new(HookManager::new());
        let scheduler = Scheduler::new(store.clone());
        let manager = PluginManager::new(
            store.clone(),
            Arc::new(InMemoryResources::new()),
            hooks.clone(),
            scheduler.clone(),
        );
        Harness {
            manager,
            store,
            hooks,
            scheduler,
        }
    }

    fn manifest() -> PluginManifest {
        let mut manifest = PluginManifest::new("loyalty", "Loyalty", "1.0.0");
        manifest.hooks = vec![
            HookDecl::Name("cart.total".into()),
            HookDecl::Detailed {
                name: "order.created".into(),
                priority: 5,
            },
        ];
        manifest.schedules = vec![
            ScheduleDecl {
                id: "expire".into(),
                schedule: "1h".into(),
                description: Some("expire points".into()),
            },
            ScheduleDecl {
                id: "report".into(),
                schedule: "0 3 * * *".into(),
                description: None,
            },
        ];
        manifest.default_config.insert("rate".into(), json!(2));
        manifest
    }

    fn plugin() -> Plugin {
        Plugin::new(manifest())
            .with_hook(
                "cart.total",
                hook_fn(|v| async move { Ok(Some(json!(v.as_i64().unwrap_or(0) + 1))) }),
            )
            .with_hook("order.created", hook_fn(|_| async { Ok(None) }))
            .with_schedule("expire", schedule_fn(|| async { Ok(()) }))
            .with_schedule("report", schedule_fn(|| async { Ok(()) }))
    }

    fn task_shapes(scheduler: &Scheduler) -> Vec<(String, Option<u64>, Option<String>)> {
        scheduler
            .tasks_for_plugin("loyalty")
            .into_iter()
            .map(|t: ScheduledTaskRecord| (t.id, t.interval_ms, t.cron_expression))
            .collect()
    }

    #[tokio::test]
    async fn install_persists_default_config_and_rejects_duplicates() {
        let h = harness();
        let record = h.manager.install(plugin()).await.unwrap();
        assert_eq!(record.status, PluginStatus::Installed);
        assert_eq!(record.config, json!({ "rate": 2 }));
        assert_eq!(record.manifest["id"], "loyalty");

        assert!(matches!(
            h.manager.install(plugin()).await,
            Err(PluginError::AlreadyInstalled(_))
        ));
        // Installing registers nothing.
        assert!(h.hooks.registrations_for_plugin("loyalty").is_empty());
    }

    #[tokio::test]
    async fn failing_install_callback_rolls_back() {
        let h = harness();
        let broken = plugin().on_install(|_| async { Err(anyhow::anyhow!("disk full")) });
        let err = h.manager.install(broken).await.unwrap_err();
        assert!(matches!(err, PluginError::Callback { phase: Phase::Install, .. }));
        assert!(h.manager.get("loyalty").await.unwrap().is_none());

        h.manager.install(plugin()).await.unwrap();
    }

    #[tokio::test]
    async fn activation_wires_hooks_and_schedules() {
        let h = harness();
        h.manager.install(plugin()).await.unwrap();
        let record = h.manager.activate("loyalty").await.unwrap();
        assert_eq!(record.status, PluginStatus::Active);
        assert!(record.date_activated.is_some());

        assert_eq!(h.hooks.apply_filter("cart.total", json!(41)).await, json!(42));
        let hooks: Vec<_> = h
            .hooks
            .registrations_for_plugin("loyalty")
            .into_iter()
            .map(|r| (r.hook_name, r.priority))
            .collect();
        assert_eq!(hooks.len(), 2);
        assert!(hooks.contains(&("order.created".to_string(), 5)));

        assert_eq!(
            task_shapes(&h.scheduler),
            vec![
                ("loyalty:expire".to_string(), Some(3_600_000), None),
                ("loyalty:report".to_string(), None, Some("0 3 * * *".to_string())),
            ]
        );
        assert!(matches!(
            h.manager.activate("loyalty").await,
            Err(PluginError::InvalidTransition { status: PluginStatus::Active, .. })
        ));
        assert_eq!(h.manager.counts().await.unwrap(), PluginCounts { active: 1, total: 1 });
    }

    #[tokio::test]
    async fn failed_activation_leaves_error_and_nothing_registered() {
        let h = harness();
        let fail = Arc::new(AtomicBool::new(true));
        let flag = fail.clone();
        let flaky = plugin().on_activate(move |_| {
            let fail = flag.load(Ordering::SeqCst);
            async move {
                if fail {
                    return Err(anyhow::anyhow!("license check failed"));
                }
                Ok(())
            }
        });
        h.manager.install(flaky).await.unwrap();

        let err = h.manager.activate("loyalty").await.unwrap_err();
        assert!(matches!(err, PluginError::Callback { phase: Phase::Activate, .. }));

        let record = h.manager.get("loyalty").await.unwrap().unwrap();
        assert_eq!(record.status, PluginStatus::Error);
        assert!(record.last_error.unwrap().contains("license check failed"));
        assert!(h.hooks.registrations_for_plugin("loyalty").is_empty());
        assert!(h.scheduler.tasks_for_plugin("loyalty").is_empty());
        assert!(h.store.list_tasks().await.unwrap().is_empty());

        // `error` is retryable.
        fail.store(false, Ordering::SeqCst);
        let record = h.manager.activate("loyalty").await.unwrap();
        assert_eq!(record.status, PluginStatus::Active);
        assert_eq!(record.last_error, None);
    }

    #[tokio::test]
    async fn missing_schedule_code_registers_no_hooks() {
        let h = harness();
        let incomplete = Plugin::new(manifest())
            .with_hook("cart.total", hook_fn(|_| async { Ok(None) }))
            .with_hook("order.created", hook_fn(|_| async { Ok(None) }))
            .with_schedule("expire", schedule_fn(|| async { Ok(()) }));
        h.manager.install(incomplete).await.unwrap();

        let err = h.manager.activate("loyalty").await.unwrap_err();
        assert!(matches!(err, PluginError::MissingHandler { kind: "schedule", .. }));
        assert!(h.hooks.registrations_for_plugin("loyalty").is_empty());
        assert!(h.scheduler.tasks_for_plugin("loyalty").is_empty());
    }

    #[tokio::test]
    async fn reactivation_restores_identical_registrations() {
        let h = harness();
        h.manager.install(plugin()).await.unwrap();
        h.manager.activate("loyalty").await.unwrap();
        let hooks = h.hooks.registrations_for_plugin("loyalty");
        let tasks = task_shapes(&h.scheduler);

        for _ in 0..2 {
            let record = h.manager.deactivate("loyalty").await.unwrap();
            assert_eq!(record.status, PluginStatus::Inactive);
            assert!(h.hooks.registrations_for_plugin("loyalty").is_empty());
            assert!(h.scheduler.tasks_for_plugin("loyalty").is_empty());

            h.manager.activate("loyalty").await.unwrap();
            assert_eq!(h.hooks.registrations_for_plugin("loyalty"), hooks);
            assert_eq!(task_shapes(&h.scheduler), tasks);
        }
    }

    #[tokio::test]
    async fn failing_deactivate_still_tears_down() {
        let h = harness();
        let stubborn = plugin().on_deactivate(|_| async { Err(anyhow::anyhow!("busy")) });
        h.manager.install(stubborn).await.unwrap();
        h.manager.activate("loyalty").await.unwrap();

        let err = h.manager.deactivate("loyalty").await.unwrap_err();
        assert!(matches!(err, PluginError::Callback { phase: Phase::Deactivate, .. }));
        assert_eq!(h.manager.get("loyalty").await.unwrap().unwrap().status, PluginStatus::Error);
        assert!(h.hooks.registrations_for_plugin("loyalty").is_empty());
        assert!(h.scheduler.tasks_for_plugin("loyalty").is_empty());

        assert!(matches!(
            h.manager.deactivate("loyalty").await,
            Err(PluginError::InvalidTransition { action: Phase::Deactivate, .. })
        ));
    }

    #[tokio::test]
    async fn uninstall_hard_deletes_everything() {
        let h = harness();
        let uninstalled = Arc::new(AtomicUsize::new(0));
        let counter = uninstalled.clone();
        let tracked = plugin().on_uninstall(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        h.manager.install(tracked).await.unwrap();
        h.manager.activate("loyalty").await.unwrap();

        let ctx = h.manager.context("loyalty");
        ctx.set_setting("last_sync", json!("2024-01-01")).await.unwrap();
        ctx.info("hello", None).await;

        h.manager.uninstall("loyalty").await.unwrap();
        assert_eq!(uninstalled.load(Ordering::SeqCst), 1);
        assert!(h.manager.get("loyalty").await.unwrap().is_none());
        assert!(h.store.get_setting("loyalty", "last_sync").await.unwrap().is_none());
        assert!(h.store.logs("loyalty").await.unwrap().is_empty());
        assert!(h.hooks.registrations_for_plugin("loyalty").is_empty());
        assert!(h.store.list_tasks().await.unwrap().is_empty());

        assert!(matches!(
            h.manager.uninstall("loyalty").await,
            Err(PluginError::NotInstalled(_))
        ));

        // Same id comes back as a fresh entity.
        let record = h.manager.install(plugin()).await.unwrap();
        assert_eq!(record.status, PluginStatus::Installed);
    }

    #[tokio::test]
    async fn unknown_plugin_is_not_installed() {
        let h = harness();
        assert!(matches!(h.manager.activate("ghost").await, Err(PluginError::NotInstalled(_))));
        assert!(matches!(h.manager.deactivate("ghost").await, Err(PluginError::NotInstalled(_))));
    }

    #[tokio::test]
    async fn restore_reactivates_persisted_active_plugins() {
        let h = harness();
        h.manager.install(plugin()).await.unwrap();
        h.manager.activate("loyalty").await.unwrap();
        let persisted_next = h.store.get_task("loyalty:expire").await.unwrap().unwrap().next_run;
        h.scheduler.shutdown();

        // Fresh process over the same store.
        let hooks = Arc::new(HookManager::new());
        let scheduler = Scheduler::new(h.store.clone());
        let manager = PluginManager::new(
            h.store.clone(),
            Arc::new(InMemoryResources::new()),
            hooks.clone(),
            scheduler.clone(),
        );

        assert_eq!(manager.restore(vec![plugin()]).await.unwrap(), 1);
        assert_eq!(hooks.registrations_for_plugin("loyalty").len(), 2);
        assert_eq!(scheduler.tasks_for_plugin("loyalty").len(), 2);
        let resumed = h.store.get_task("loyalty:expire").await.unwrap().unwrap().next_run;
        assert_eq!(resumed, persisted_next);
        assert_eq!(
            manager.get("loyalty").await.unwrap().unwrap().status,
            PluginStatus::Active
        );
    }
}
