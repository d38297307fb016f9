//! Axum router over a running [`Runtime`].
//!
//! - `routes/`: handlers, one file per area
//! - `errors.rs`: consistent JSON error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use storefront_infra::Runtime;

use crate::middleware;

pub mod errors;
pub mod routes;

/// Build the full HTTP router (public entrypoint used by `main.rs` and tests).
pub fn build_app(runtime: Arc<Runtime>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/plugins", routes::plugins::router())
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::log_requests))
                .layer(Extension(runtime)),
        )
}
