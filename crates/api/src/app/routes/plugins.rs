use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use storefront_infra::Runtime;

use crate::app::errors::{json_error, plugin_error_to_response};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_plugins))
        .route("/:id", get(get_plugin).delete(uninstall_plugin))
        .route("/:id/activate", post(activate_plugin))
        .route("/:id/deactivate", post(deactivate_plugin))
}

async fn list_plugins(Extension(runtime): Extension<Arc<Runtime>>) -> Response {
    match runtime.plugins.list().await {
        Ok(plugins) => Json(plugins).into_response(),
        Err(e) => plugin_error_to_response(e),
    }
}

async fn get_plugin(Extension(runtime): Extension<Arc<Runtime>>, Path(id): Path<String>) -> Response {
    match runtime.plugins.get(&id).await {
        Ok(Some(plugin)) => Json(plugin).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "not_found", format!("plugin {id} is not installed")),
        Err(e) => plugin_error_to_response(e),
    }
}

async fn activate_plugin(Extension(runtime): Extension<Arc<Runtime>>, Path(id): Path<String>) -> Response {
    match runtime.plugins.activate(&id).await {
        Ok(plugin) => Json(plugin).into_response(),
        Err(e) => plugin_error_to_response(e),
    }
}

async fn deactivate_plugin(Extension(runtime): Extension<Arc<Runtime>>, Path(id): Path<String>) -> Response {
    match runtime.plugins.deactivate(&id).await {
        Ok(plugin) => Json(plugin).into_response(),
        Err(e) => plugin_error_to_response(e),
    }
}

async fn uninstall_plugin(Extension(runtime): Extension<Arc<Runtime>>, Path(id): Path<String>) -> Response {
    match runtime.plugins.uninstall(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => plugin_error_to_response(e),
    }
}
