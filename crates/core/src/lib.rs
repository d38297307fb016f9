//! `storefront-core`: shared building blocks for the storefront background core.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the domain error model and the order shape the workers read.

pub mod error;
pub mod id;
pub mod order;

pub use error::{DomainError, DomainResult};
pub use id::{CouponId, CustomerId, DeliveryId, OrderId, ProductId, WebhookId};
pub use order::{LineItem, Order, OrderStatus};
