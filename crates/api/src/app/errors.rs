use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use catalog_infra::projections::ReplayError;
use catalog_infra::{CommandError, QueryError};

pub fn command_error_to_response(err: CommandError) -> axum::response::Response {
    match err {
        CommandError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        CommandError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("product {id} not found")),
        CommandError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        CommandError::TransientStore(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg),
    }
}

pub fn query_error_to_response(err: QueryError) -> axum::response::Response {
    match err {
        QueryError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("product {id} not found")),
        QueryError::TransientStore(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", msg),
    }
}

pub fn replay_error_to_response(err: ReplayError) -> axum::response::Response {
    match err {
        ReplayError::DeadLetter(e) => json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string()),
        ReplayError::Projection(e) if e.is_retryable() => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string())
        }
        ReplayError::Projection(e) => json_error(StatusCode::UNPROCESSABLE_ENTITY, "rejected", e.to_string()),
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
