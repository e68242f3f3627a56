use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use serde::Deserialize;

use catalog_core::DomainError;
use catalog_infra::projections::{DeadLetter, ParkedBody};
use catalog_infra::read_model::ReadRecord;
use catalog_infra::{CommandOutcome, PageResult};
use catalog_products::{ProductFields, ProductId};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    /// Client-chosen id; generated when absent.
    pub id: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i64,
}

impl CreateProductRequest {
    pub fn into_parts(self) -> Result<(ProductId, ProductFields), axum::response::Response> {
        let product_id = match self.id.as_deref() {
            Some(raw) => parse_product_id(raw)?,
            None => ProductId::generate(),
        };
        let fields = ProductFields {
            name: self.name,
            description: self.description,
            price: self.price,
            stock: self.stock,
        };
        Ok((product_id, fields))
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateProductRequest {
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub stock: i64,
}

impl From<UpdateProductRequest> for ProductFields {
    fn from(body: UpdateProductRequest) -> Self {
        ProductFields {
            name: body.name,
            description: body.description,
            price: body.price,
            stock: body.stock,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub limit: Option<u32>,
    pub offset: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

// -------------------------
// Request parsing helpers
// -------------------------

pub fn parse_product_id(raw: &str) -> Result<ProductId, axum::response::Response> {
    raw.parse().map_err(|e: DomainError| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string())
    })
}

/// Unwrap a JSON body, answering malformed input with the usual 400 shape.
pub fn json_body<T>(body: Result<axum::Json<T>, JsonRejection>) -> Result<T, axum::response::Response> {
    body.map(|axum::Json(v)| v)
        .map_err(|rejection| errors::json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text()))
}

// -------------------------
// JSON mapping helpers
// -------------------------

pub fn outcome_to_json(outcome: CommandOutcome) -> serde_json::Value {
    let mut body = serde_json::json!({
        "id": outcome.product_id.to_string(),
        "event_id": outcome.event_id.to_string(),
        "version": outcome.version,
        "published": outcome.published,
    });
    if let Some(reason) = outcome.publish_error {
        body["warning"] = serde_json::Value::String(format!(
            "accepted but not yet published ({reason}); it will be delivered by the outbox relay"
        ));
    }
    body
}

pub fn product_to_json(record: ReadRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.product.id.to_string(),
        "name": record.product.name,
        "description": record.product.description,
        "price": record.product.price,
        "stock": record.product.stock,
        "version": record.last_applied_version,
    })
}

pub fn page_to_json(page: PageResult) -> serde_json::Value {
    serde_json::json!({
        "items": page.items.into_iter().map(product_to_json).collect::<Vec<_>>(),
        "total": page.total,
        "limit": page.limit,
        "offset": page.offset,
    })
}

pub fn dead_letter_to_json(entry: DeadLetter) -> serde_json::Value {
    let mut body = serde_json::json!({
        "id": entry.id.to_string(),
        "consumer_group": entry.consumer_group,
        "partition": entry.partition,
        "offset": entry.offset,
        "reason": entry.reason,
        "attempts": entry.attempts,
        "failed_at": entry.failed_at.to_rfc3339(),
    });
    match entry.body {
        ParkedBody::Event(envelope) => {
            body["event_id"] = serde_json::Value::String(envelope.event_id().to_string());
            body["entity_id"] = serde_json::Value::String(envelope.entity_id().to_string());
            body["version"] = serde_json::Value::from(envelope.version());
        }
        ParkedBody::Undecodable(raw) => {
            body["raw"] = serde_json::Value::String(raw);
        }
    }
    body
}
