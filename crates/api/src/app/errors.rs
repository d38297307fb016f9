use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use storefront_infra::plugins::PluginError;

pub fn plugin_error_to_response(err: PluginError) -> axum::response::Response {
    match err {
        PluginError::NotInstalled(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        PluginError::AlreadyInstalled(_) | PluginError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        PluginError::MissingHandler { .. } | PluginError::Callback { .. } | PluginError::Scheduler(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "plugin_failed", err.to_string())
        }
        PluginError::Store(_) | PluginError::Resource(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
