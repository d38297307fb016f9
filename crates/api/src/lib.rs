//! HTTP surface of the storefront core: health and plugin lifecycle routes.

pub mod app;
pub mod middleware;
