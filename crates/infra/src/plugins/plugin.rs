use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use storefront_hooks::HookCallback;

use super::{PluginContext, PluginManifest};
use crate::scheduler::ScheduleHandler;

/// One lifecycle callback (install, activate, deactivate or uninstall).
#[async_trait]
pub trait LifecycleHook: Send + Sync + 'static {
    async fn call(&self, ctx: PluginContext) -> anyhow::Result<()>;
}

struct FnLifecycle<F>(F);

#[async_trait]
impl<F, Fut> LifecycleHook for FnLifecycle<F>
where
    F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: PluginContext) -> anyhow::Result<()> {
        (self.0)(ctx).await
    }
}

fn lifecycle_fn<F, Fut>(f: F) -> Arc<dyn LifecycleHook>
where
    F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnLifecycle(f))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Install,
    Activate,
    Deactivate,
    Uninstall,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Install => "install",
            Phase::Activate => "activate",
            Phase::Deactivate => "deactivate",
            Phase::Uninstall => "uninstall",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A plugin: its manifest, optional lifecycle callbacks, and the code behind
/// every hook and schedule the manifest declares.
///
/// ```ignore
/// let plugin = Plugin::new(manifest)
///     .on_activate(|ctx| async move { ctx.info("hello", None).await; Ok(()) })
///     .with_hook("cart.total", hook_fn(|v| async move { Ok(Some(v)) }))
///     .with_schedule("cleanup", schedule_fn(|| async { Ok(()) }));
/// ```
pub struct Plugin {
    manifest: PluginManifest,
    lifecycle: HashMap<Phase, Arc<dyn LifecycleHook>>,
    hooks: HashMap<String, Arc<dyn HookCallback>>,
    schedules: HashMap<String, Arc<dyn ScheduleHandler>>,
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.manifest.id)
            .field("version", &self.manifest.version)
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn new(manifest: PluginManifest) -> Self {
        Self {
            manifest,
            lifecycle: HashMap::new(),
            hooks: HashMap::new(),
            schedules: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn on<F, Fut>(mut self, phase: Phase, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.lifecycle.insert(phase, lifecycle_fn(f));
        self
    }

    pub fn on_install<F, Fut>(self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on(Phase::Install, f)
    }

    pub fn on_activate<F, Fut>(self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on(Phase::Activate, f)
    }

    pub fn on_deactivate<F, Fut>(self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on(Phase::Deactivate, f)
    }

    pub fn on_uninstall<F, Fut>(self, f: F) -> Self
    where
        F: Fn(PluginContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on(Phase::Uninstall, f)
    }

    /// Code for a hook named in the manifest.
    pub fn with_hook(mut self, hook_name: impl Into<String>, callback: Arc<dyn HookCallback>) -> Self {
        self.hooks.insert(hook_name.into(), callback);
        self
    }

    /// Code for a schedule id named in the manifest.
    pub fn with_schedule(mut self, schedule_id: impl Into<String>, handler: Arc<dyn ScheduleHandler>) -> Self {
        self.schedules.insert(schedule_id.into(), handler);
        self
    }

    pub(crate) fn lifecycle(&self, phase: Phase) -> Option<&Arc<dyn LifecycleHook>> {
        self.lifecycle.get(&phase)
    }

    pub(crate) fn hook(&self, hook_name: &str) -> Option<&Arc<dyn HookCallback>> {
        self.hooks.get(hook_name)
    }

    pub(crate) fn schedule(&self, schedule_id: &str) -> Option<&Arc<dyn ScheduleHandler>> {
        self.schedules.get(schedule_id)
    }
}
