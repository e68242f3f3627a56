//! Operator endpoints for parked (dead-lettered) events.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use catalog_events::ApplyOutcome;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/dead-letters", get(list_dead_letters))
        .route("/dead-letters/:id/replay", post(replay_dead_letter))
}

pub async fn list_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::ListParams>,
) -> axum::response::Response {
    let limit = params.limit.unwrap_or(100);
    match services.dead_letters().list(limit).await {
        Ok(entries) => {
            let items: Vec<_> = entries.into_iter().map(dto::dead_letter_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", e.to_string()),
    }
}

pub async fn replay_dead_letter(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: Uuid = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid dead letter id"),
    };

    match services.projection().replay_dead_letter(services.dead_letters(), id).await {
        Ok(Some(ApplyOutcome::Applied)) => {
            (StatusCode::OK, Json(serde_json::json!({ "id": id.to_string(), "outcome": "applied" }))).into_response()
        }
        Ok(Some(ApplyOutcome::Stale { current })) => (
            StatusCode::OK,
            Json(serde_json::json!({ "id": id.to_string(), "outcome": "stale", "current_version": current })),
        )
            .into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("dead letter {id} not found")),
        Err(e) => errors::replay_error_to_response(e),
    }
}
