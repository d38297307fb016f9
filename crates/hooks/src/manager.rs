//! Hook registration table and filter/action execution.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;
use tracing::{debug, warn};

use crate::callback::{HookCallback, HookValue};

/// Priority used when a plugin does not declare one.
pub const DEFAULT_PRIORITY: i32 = 10;

/// One plugin callback subscribed to one hook name.
#[derive(Clone)]
pub struct HookRegistration {
    hook_name: String,
    plugin_id: String,
    callback: Arc<dyn HookCallback>,
    priority: i32,
}

impl HookRegistration {
    pub fn new(
        hook_name: impl Into<String>,
        plugin_id: impl Into<String>,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) -> Self {
        Self {
            hook_name: hook_name.into(),
            plugin_id: plugin_id.into(),
            callback,
            priority,
        }
    }

    pub fn hook_name(&self) -> &str {
        &self.hook_name
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }
}

impl core::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("hook_name", &self.hook_name)
            .field("plugin_id", &self.plugin_id)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Callback-free view of a registration (observability, comparisons in tests).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RegistrationInfo {
    pub hook_name: String,
    pub plugin_id: String,
    pub priority: i32,
}

/// A callback that failed during a chain and was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookFailure {
    pub hook_name: String,
    pub plugin_id: String,
    pub error: String,
}

/// Result of running a filter chain: the final value plus every skipped failure.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub value: HookValue,
    pub failures: Vec<HookFailure>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Mode {
    Filter,
    Action,
}

/// Process-wide hook registry.
///
/// Constructed once at startup and shared by `Arc`. All mutation goes through
/// `register`/`unregister`/`unregister_plugin`, which keep each per-hook list
/// sorted by priority.
#[derive(Default)]
pub struct HookManager {
    registry: RwLock<HashMap<String, Vec<HookRegistration>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `callback` to `hook_name` on behalf of `plugin_id`.
    ///
    /// The registration is inserted after every existing registration with a
    /// priority `<=` its own, so ties preserve registration order.
    pub fn register(
        &self,
        hook_name: &str,
        plugin_id: &str,
        callback: Arc<dyn HookCallback>,
        priority: i32,
    ) {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let list = registry.entry(hook_name.to_string()).or_default();
        let at = list.partition_point(|r| r.priority <= priority);
        list.insert(at, HookRegistration::new(hook_name, plugin_id, callback, priority));

        debug!(hook = hook_name, plugin_id, priority, "hook registered");
    }

    /// Remove every registration of `plugin_id` on `hook_name`. Returns the number removed.
    pub fn unregister(&self, hook_name: &str, plugin_id: &str) -> usize {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = registry.get_mut(hook_name) else {
            return 0;
        };

        let before = list.len();
        list.retain(|r| r.plugin_id != plugin_id);
        let removed = before - list.len();
        if list.is_empty() {
            registry.remove(hook_name);
        }
        removed
    }

    /// Remove every registration of `plugin_id` across all hooks. Returns the number removed.
    pub fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        registry.retain(|_, list| {
            let before = list.len();
            list.retain(|r| r.plugin_id != plugin_id);
            removed += before - list.len();
            !list.is_empty()
        });

        if removed > 0 {
            debug!(plugin_id, removed, "plugin hooks unregistered");
        }
        removed
    }

    pub fn has_callbacks(&self, hook_name: &str) -> bool {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(hook_name).is_some_and(|l| !l.is_empty())
    }

    /// Registrations for one hook, in execution order.
    pub fn registrations(&self, hook_name: &str) -> Vec<RegistrationInfo> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .get(hook_name)
            .map(|list| list.iter().map(info).collect())
            .unwrap_or_default()
    }

    /// Every registration owned by `plugin_id`, sorted by hook name then execution order.
    pub fn registrations_for_plugin(&self, plugin_id: &str) -> Vec<RegistrationInfo> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = registry.keys().collect();
        names.sort();

        names
            .into_iter()
            .flat_map(|name| registry[name].iter())
            .filter(|r| r.plugin_id == plugin_id)
            .map(info)
            .collect()
    }

    /// Run a filter chain and return the final value.
    pub async fn apply_filter(&self, hook_name: &str, value: HookValue) -> HookValue {
        self.apply_filter_detailed(hook_name, value).await.value
    }

    /// Run a filter chain, returning the final value and the skipped failures.
    pub async fn apply_filter_detailed(&self, hook_name: &str, value: HookValue) -> FilterOutcome {
        self.run_isolated(hook_name, value, Mode::Filter).await
    }

    /// Run an action chain. Returns the callbacks that failed (already logged).
    pub async fn do_action(&self, hook_name: &str, value: HookValue) -> Vec<HookFailure> {
        self.run_isolated(hook_name, value, Mode::Action).await.failures
    }

    fn snapshot(&self, hook_name: &str) -> Vec<HookRegistration> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry.get(hook_name).cloned().unwrap_or_default()
    }

    /// Fault-isolating chain runner.
    ///
    /// Callbacks are awaited one at a time against a snapshot of the table (the
    /// lock is never held across an await). Errors and panics are collected
    /// and logged, and the chain continues with the current value.
    async fn run_isolated(&self, hook_name: &str, value: HookValue, mode: Mode) -> FilterOutcome {
        let mut current = value;
        let mut failures = Vec::new();

        for reg in self.snapshot(hook_name) {
            let call = reg.callback.call(current.clone());
            let result = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(result) => result,
                Err(panic) => Err(anyhow::anyhow!("callback panicked: {}", panic_message(&panic))),
            };

            match result {
                Ok(Some(next)) if mode == Mode::Filter => current = next,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        hook = hook_name,
                        plugin_id = %reg.plugin_id,
                        error = %err,
                        "hook callback failed; skipping"
                    );
                    failures.push(HookFailure {
                        hook_name: hook_name.to_string(),
                        plugin_id: reg.plugin_id.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }

        FilterOutcome {
            value: current,
            failures,
        }
    }
}

impl core::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("HookManager")
            .field("hooks", &registry.len())
            .finish()
    }
}

fn info(r: &HookRegistration) -> RegistrationInfo {
    RegistrationInfo {
        hook_name: r.hook_name.clone(),
        plugin_id: r.plugin_id.clone(),
        priority: r.priority,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::hook_fn;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn add(n: i64) -> Arc<dyn HookCallback> {
        hook_fn(move |v| async move { Ok(Some(json!(v.as_i64().unwrap_or(0) + n))) })
    }

    fn failing() -> Arc<dyn HookCallback> {
        hook_fn(|_v| async move { Err(anyhow::anyhow!("plugin bug")) })
    }

    #[tokio::test]
    async fn filter_without_callbacks_is_identity() {
        let hooks = HookManager::new();
        let value = json!({"price": 10, "name": "mug"});
        assert_eq!(hooks.apply_filter("product_price", value.clone()).await, value);
    }

    #[tokio::test]
    async fn failing_callback_is_skipped_and_chain_continues() {
        let hooks = HookManager::new();
        hooks.register("total", "a", add(1), 10);
        hooks.register("total", "b", add(1), 10);
        hooks.register("total", "bad", failing(), 10);
        hooks.register("total", "c", add(1), 20);

        let outcome = hooks.apply_filter_detailed("total", json!(5)).await;
        assert_eq!(outcome.value, json!(8));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].plugin_id, "bad");
        assert_eq!(outcome.failures[0].hook_name, "total");
    }

    #[tokio::test]
    async fn panicking_callback_is_isolated() {
        let hooks = HookManager::new();
        hooks.register("total", "a", add(1), 1);
        hooks.register(
            "total",
            "panics",
            hook_fn(|_v| async move {
                if true {
                    panic!("boom");
                }
                Ok(None)
            }),
            2,
        );
        hooks.register("total", "b", add(1), 3);

        let outcome = hooks.apply_filter_detailed("total", json!(0)).await;
        assert_eq!(outcome.value, json!(2));
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].error.contains("boom"));
    }

    #[tokio::test]
    async fn none_leaves_value_unchanged() {
        let hooks = HookManager::new();
        hooks.register("title", "p", hook_fn(|_v| async move { Ok(None) }), 10);
        assert_eq!(hooks.apply_filter("title", json!("x")).await, json!("x"));
    }

    #[tokio::test]
    async fn callbacks_run_in_priority_order_with_stable_ties() {
        let hooks = HookManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for (plugin, priority) in [("late", 50), ("first", 1), ("tie-a", 10), ("tie-b", 10)] {
            let seen = seen.clone();
            hooks.register(
                "order_created",
                plugin,
                hook_fn(move |_v| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(plugin);
                        Ok(None)
                    }
                }),
                priority,
            );
        }

        let failures = hooks.do_action("order_created", json!({"id": 1})).await;
        assert!(failures.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "tie-a", "tie-b", "late"]);
    }

    #[tokio::test]
    async fn action_ignores_return_values() {
        let hooks = HookManager::new();
        hooks.register("notify", "p", add(100), 10);
        let failures = hooks.do_action("notify", json!(1)).await;
        assert!(failures.is_empty());
    }

    #[test]
    fn unregister_removes_only_that_plugin() {
        let hooks = HookManager::new();
        hooks.register("a", "p1", add(1), 10);
        hooks.register("a", "p2", add(1), 10);
        hooks.register("b", "p1", add(1), 10);

        assert_eq!(hooks.unregister("a", "p1"), 1);
        assert_eq!(hooks.registrations("a").len(), 1);
        assert!(hooks.has_callbacks("b"));

        assert_eq!(hooks.unregister_plugin("p1"), 1);
        assert!(!hooks.has_callbacks("b"));
        assert_eq!(hooks.registrations_for_plugin("p2").len(), 1);
        assert_eq!(hooks.unregister("missing", "p2"), 0);
    }

    proptest! {
        #[test]
        fn iteration_order_is_a_stable_priority_sort(priorities in proptest::collection::vec(-5i32..5, 0..30)) {
            let hooks = HookManager::new();
            for (i, p) in priorities.iter().enumerate() {
                hooks.register("h", &format!("p{i}"), add(0), *p);
            }

            let mut expected: Vec<(i32, String)> = priorities
                .iter()
                .enumerate()
                .map(|(i, p)| (*p, format!("p{i}")))
                .collect();
            expected.sort_by_key(|(p, _)| *p);

            let actual: Vec<(i32, String)> = hooks
                .registrations("h")
                .into_iter()
                .map(|r| (r.priority, r.plugin_id))
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
