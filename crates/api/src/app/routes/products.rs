use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;

use catalog_products::{CreateProduct, DeleteProduct, UpdateProduct};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_products).post(create_product))
        .route("/page", get(list_products_page))
        .route("/:id", get(get_product).put(update_product).delete(delete_product))
}

pub async fn create_product(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateProductRequest>, JsonRejection>,
) -> axum::response::Response {
    let (product_id, fields) = match dto::json_body(body).and_then(dto::CreateProductRequest::into_parts) {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };

    let cmd = CreateProduct {
        product_id,
        fields,
        occurred_at: Utc::now(),
    };

    match services.commands().create(cmd).await {
        Ok(outcome) => (StatusCode::CREATED, Json(dto::outcome_to_json(outcome))).into_response(),
        Err(e) => errors::command_error_to_response(e),
    }
}

pub async fn update_product(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<dto::UpdateProductRequest>, JsonRejection>,
) -> axum::response::Response {
    let product_id = match dto::parse_product_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = match dto::json_body(body) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let cmd = UpdateProduct {
        product_id,
        fields: body.into(),
        occurred_at: Utc::now(),
    };

    match services.commands().update(cmd).await {
        Ok(outcome) => (StatusCode::OK, Json(dto::outcome_to_json(outcome))).into_response(),
        Err(e) => errors::command_error_to_response(e),
    }
}

pub async fn delete_product(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let product_id = match dto::parse_product_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let cmd = DeleteProduct {
        product_id,
        occurred_at: Utc::now(),
    };

    match services.commands().delete(cmd).await {
        Ok(outcome) => (StatusCode::OK, Json(dto::outcome_to_json(outcome))).into_response(),
        Err(e) => errors::command_error_to_response(e),
    }
}

pub async fn get_product(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let product_id = match dto::parse_product_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.queries().get(product_id).await {
        Ok(record) => (StatusCode::OK, Json(dto::product_to_json(record))).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}

pub async fn list_products(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.queries().list_all().await {
        Ok(records) => {
            let items: Vec<_> = records.into_iter().map(dto::product_to_json).collect();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::query_error_to_response(e),
    }
}

pub async fn list_products_page(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::PageParams>,
) -> axum::response::Response {
    let limit = params.limit.unwrap_or(20);
    let offset = params.offset.unwrap_or(0);

    match services.queries().list_page(limit, offset).await {
        Ok(page) => (StatusCode::OK, Json(dto::page_to_json(page))).into_response(),
        Err(e) => errors::query_error_to_response(e),
    }
}
