use std::sync::Arc;

use axum::{Extension, Json, http::StatusCode};

use storefront_infra::{HealthReport, HealthStatus, Runtime};

/// `GET /health`: 200 when healthy, 503 when degraded; the body is the same.
pub async fn health(Extension(runtime): Extension<Arc<Runtime>>) -> (StatusCode, Json<HealthReport>) {
    let report = runtime.health().await;
    let code = match report.status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}
