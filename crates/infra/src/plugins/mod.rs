//! Plugin lifecycle: install, activate, deactivate, uninstall.
//!
//! Activation wires a plugin's declared hooks into the [`HookManager`] and its
//! declared schedules into the [`Scheduler`]; deactivation always tears both
//! down. Lifecycle failures land the plugin in `error` and are returned to
//! the caller.
//!
//! [`HookManager`]: storefront_hooks::HookManager
//! [`Scheduler`]: crate::scheduler::Scheduler

mod context;
mod manager;
mod manifest;
mod plugin;

pub use context::PluginContext;
pub use manager::{PluginCounts, PluginManager};
pub use manifest::{HookDecl, PluginManifest, ScheduleDecl};
pub use plugin::{LifecycleHook, Phase, Plugin};

use crate::resources::ResourceError;
use crate::scheduler::SchedulerError;
use crate::store::{PluginStatus, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin {0} is not installed")]
    NotInstalled(String),

    #[error("plugin {0} is already installed")]
    AlreadyInstalled(String),

    #[error("cannot {action} plugin {id} while it is {status}")]
    InvalidTransition {
        id: String,
        status: PluginStatus,
        action: Phase,
    },

    #[error("plugin {id} declares {kind} '{name}' but provides no code for it")]
    MissingHandler {
        id: String,
        kind: &'static str,
        name: String,
    },

    #[error("plugin {id} {phase} callback failed: {message}")]
    Callback {
        id: String,
        phase: Phase,
        message: String,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}
