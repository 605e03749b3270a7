use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use isostock_core::{AggregateRoot, ConcurrencyStamp};

use super::isolation::IsolationLevel;

/// The retryable class of store failures.
///
/// All three mean "another writer got there first"; re-reading and re-applying the
/// change against fresh state is the correct reaction to each.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// The concurrency stamp read earlier no longer matches the stored one.
    StampMismatch,
    /// The store aborted the transaction to preserve serializability
    /// (also used for deadlock victims).
    SerializationFailure,
    /// Snapshot isolation: the row was modified after the snapshot was taken.
    WriteConflict,
}

impl core::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            ConflictKind::StampMismatch => "concurrency stamp mismatch",
            ConflictKind::SerializationFailure => "serialization failure",
            ConflictKind::WriteConflict => "write-write conflict",
        })
    }
}

/// Store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, transport) as opposed
/// to domain errors (validation, invariants).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("optimistic concurrency check failed: {0}")]
    StampMismatch(String),

    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("write-write conflict: {0}")]
    WriteConflict(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction is no longer active")]
    TransactionClosed,

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// `Some` for the retryable conflict class, `None` for everything else.
    pub fn conflict_kind(&self) -> Option<ConflictKind> {
        match self {
            StoreError::StampMismatch(_) => Some(ConflictKind::StampMismatch),
            StoreError::SerializationFailure(_) => Some(ConflictKind::SerializationFailure),
            StoreError::WriteConflict(_) => Some(ConflictKind::WriteConflict),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.conflict_kind().is_some()
    }
}

/// A store that hands out transactions over entities of type `E`.
///
/// Implementations must:
/// - honour the requested [`IsolationLevel`] (or the documented translation of it)
/// - reject writes whose original concurrency stamp is stale
/// - report conflicts through the retryable [`StoreError`] variants only
#[async_trait]
pub trait TransactionalStore<E>: Send + Sync
where
    E: AggregateRoot + Send + Sync + 'static,
{
    type Transaction: StoreTransaction<E>;

    /// Open a transaction at `isolation`.
    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Transaction, StoreError>;
}

/// One open transaction.
///
/// Dropping a transaction without calling [`commit`](StoreTransaction::commit) or
/// [`rollback`](StoreTransaction::rollback) rolls it back.
#[async_trait]
pub trait StoreTransaction<E>: Send
where
    E: AggregateRoot + Send + Sync + 'static,
{
    fn isolation(&self) -> IsolationLevel;

    /// Read one entity as visible at this transaction's isolation level.
    async fn get(&mut self, id: &E::Id) -> Result<Option<E>, StoreError>;

    /// Read every visible entity, ordered by id.
    async fn list(&mut self) -> Result<Vec<E>, StoreError>;

    /// Insert a new entity. Fails with [`StoreError::Duplicate`] if the id exists.
    async fn insert(&mut self, entity: &E) -> Result<(), StoreError>;

    /// Persist `entity`, provided the stored stamp still equals `original`.
    async fn update(&mut self, entity: &E, original: &ConcurrencyStamp) -> Result<(), StoreError>;

    /// Delete the entity, provided the stored stamp still equals `original`.
    async fn delete(&mut self, id: &E::Id, original: &ConcurrencyStamp) -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl<E, S> TransactionalStore<E> for Arc<S>
where
    E: AggregateRoot + Send + Sync + 'static,
    S: TransactionalStore<E> + ?Sized,
{
    type Transaction = S::Transaction;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Transaction, StoreError> {
        (**self).begin(isolation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        assert_eq!(
            StoreError::StampMismatch("x".into()).conflict_kind(),
            Some(ConflictKind::StampMismatch)
        );
        assert_eq!(
            StoreError::SerializationFailure("x".into()).conflict_kind(),
            Some(ConflictKind::SerializationFailure)
        );
        assert_eq!(
            StoreError::WriteConflict("x".into()).conflict_kind(),
            Some(ConflictKind::WriteConflict)
        );

        assert!(!StoreError::Duplicate("x".into()).is_conflict());
        assert!(!StoreError::Unavailable("x".into()).is_conflict());
        assert!(!StoreError::TransactionClosed.is_conflict());
        assert!(!StoreError::Backend("x".into()).is_conflict());
    }
}
