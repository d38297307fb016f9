use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

/// Value threaded through hook chains.
pub type HookValue = serde_json::Value;

/// A plugin-provided hook callback.
///
/// For filter hooks, `Ok(Some(v))` replaces the current value and `Ok(None)`
/// leaves it unchanged. For action hooks the returned value is ignored.
#[async_trait]
pub trait HookCallback: Send + Sync + 'static {
    async fn call(&self, value: HookValue) -> anyhow::Result<Option<HookValue>>;
}

/// Closure adapter for [`HookCallback`].
struct FnHook<F>(F);

#[async_trait]
impl<F, Fut> HookCallback for FnHook<F>
where
    F: Fn(HookValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<HookValue>>> + Send + 'static,
{
    async fn call(&self, value: HookValue) -> anyhow::Result<Option<HookValue>> {
        (self.0)(value).await
    }
}

/// Wrap an async closure as a shareable hook callback.
///
/// ```ignore
/// let add_one = hook_fn(|v| async move { Ok(Some(json!(v.as_i64().unwrap_or(0) + 1))) });
/// ```
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn HookCallback>
where
    F: Fn(HookValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<HookValue>>> + Send + 'static,
{
    Arc::new(FnHook(f))
}
