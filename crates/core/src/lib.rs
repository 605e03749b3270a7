//! `isostock-core`: identity, concurrency stamps and the domain error model.
//!
//! Pure domain primitives; nothing here knows about transactions or storage.

pub mod aggregate;
pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use aggregate::{AggregateRoot, ConcurrencyStamp};
pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::AggregateId;
pub use value_object::ValueObject;
