//! Extensibility and background-processing core of the storefront backend.
//!
//! - [`jobs`]: named job queues over Redis, with an in-process fallback
//! - [`workers`]: webhook delivery, email and order-processing consumers
//! - [`webhooks`]: subscriber fan-out, HMAC signing and delivery tracking
//! - [`scheduler`]: interval and cron tasks with persisted run times
//! - [`plugins`]: plugin lifecycle tying hooks, schedules and config together
//! - [`runtime`]: builds all of the above once and shuts it down
//!
//! The hook bus itself lives in `storefront-hooks`.

pub mod config;
pub mod health;
pub mod jobs;
pub mod plugins;
pub mod resources;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod webhooks;
pub mod workers;

pub use config::CoreConfig;
pub use health::{HealthReport, HealthStatus};
pub use runtime::{Runtime, RuntimeError, Services, Stores};
