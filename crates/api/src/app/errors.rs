use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use taskmill_infra::EngineError;
use taskmill_infra::jobs::JobStoreError;

pub fn engine_error_to_response(err: EngineError) -> axum::response::Response {
    match err {
        EngineError::Store(JobStoreError::NotFound(id)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
        }
        EngineError::Store(e @ JobStoreError::InvalidState { .. }) => {
            json_error(StatusCode::CONFLICT, "invalid_state", e.to_string())
        }
        EngineError::Store(e @ JobStoreError::AlreadyExists(_)) => {
            json_error(StatusCode::CONFLICT, "already_exists", e.to_string())
        }
        EngineError::Store(e) if e.is_unavailable() => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
        }
        EngineError::Store(e) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
        EngineError::Timeout(after) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "timeout",
            format!("store did not answer within {after:?}"),
        ),
        EngineError::ShuttingDown => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", "engine is shutting down")
        }
        EngineError::InvalidOptions(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
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
