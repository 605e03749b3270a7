//! Aggregate root trait and the optimistic concurrency token it carries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::Entity;
use crate::error::{DomainError, DomainResult};

/// Opaque optimistic-concurrency token.
///
/// A fresh stamp is generated on creation and on every successful mutation. Stores
/// compare the stamp a writer read against the stamp currently persisted; a mismatch
/// means another writer committed in between (a would-be lost update).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyStamp(String);

impl ConcurrencyStamp {
    /// Generate a new random stamp (32 lowercase hex characters).
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wrap a stamp loaded from storage.
    pub fn from_persisted(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify that `actual` is still the stamp this one was read as.
    pub fn check(&self, actual: &ConcurrencyStamp) -> DomainResult<()> {
        if self == actual {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {}, actual: {})",
                self.0, actual.0
            )))
        }
    }
}

impl Default for ConcurrencyStamp {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ConcurrencyStamp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Aggregate root: an entity that is the unit of consistency and of optimistic locking.
///
/// Aggregates stay free of IO. Mutating methods validate first and rotate the stamp
/// only when the change is accepted.
pub trait AggregateRoot: Entity {
    /// Stamp of the current in-memory state.
    fn concurrency_stamp(&self) -> &ConcurrencyStamp;
}
