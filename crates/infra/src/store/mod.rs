//! Transactional store boundary.
//!
//! This module defines the infrastructure-facing abstraction the retry logic is
//! written against: a store that opens transactions at a requested isolation level,
//! and a transaction exposing `{get, list, insert, update, delete, commit, rollback}`
//! with optimistic concurrency on every write. Isolation semantics, locking and
//! conflict detection belong to the backend; the boundary only classifies the
//! outcome (see [`StoreError::conflict_kind`]).

pub mod in_memory;
pub mod isolation;
pub mod postgres;
pub mod r#trait;

pub use in_memory::{InMemoryStore, InMemoryTransaction};
pub use isolation::{BackendMapping, IsolationGuarantees, IsolationLevel, POSTGRES_TRANSLATION};
pub use postgres::{PostgresProductStore, PostgresTransaction};
pub use r#trait::{ConflictKind, StoreError, StoreTransaction, TransactionalStore};
