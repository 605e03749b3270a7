//! Products domain module.
//!
//! This crate contains business rules for the product catalogue, implemented purely as
//! deterministic domain logic (no IO, no storage). Storage and transaction handling
//! live in `isostock-infra`.

pub mod product;

pub use product::{
    MAX_NAME_LENGTH, PRICE_SCALE, PRICE_UPPER_BOUND, Price, Product, ProductFieldsUpdate,
    ProductId,
};
