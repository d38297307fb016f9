//! In-process hook bus (mechanics only).
//!
//! Plugins subscribe named callbacks; business code publishes through two
//! execution modes over the same registration table:
//!
//! - **Filter** hooks thread a value through every callback, each one may
//!   return a replacement that becomes the input of the next.
//! - **Action** hooks notify every callback; return values are ignored.
//!
//! ## Ordering
//!
//! Callbacks for one hook name always run in ascending priority order (lower
//! number runs earlier); ties keep registration order.
//!
//! ## Fault isolation
//!
//! A failing (or panicking) callback is logged with its plugin id and hook name
//! and skipped. The chain always continues with the unmodified current value, so
//! one bad plugin cannot abort the pipeline.

pub mod callback;
pub mod manager;

pub use callback::{HookCallback, HookValue, hook_fn};
pub use manager::{
    DEFAULT_PRIORITY, FilterOutcome, HookFailure, HookManager, HookRegistration, RegistrationInfo,
};
