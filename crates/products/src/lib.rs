//! Products domain module (write model).
//!
//! This crate contains business rules for products, implemented purely as
//! deterministic domain logic (no IO, no HTTP, no storage).

pub mod product;

pub use product::{
    CreateProduct, DeleteProduct, Product, ProductCommand, ProductEnvelope, ProductEvent,
    ProductFields, ProductId, ProductSnapshot, UpdateProduct,
};
