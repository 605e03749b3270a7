use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use isostock_core::{AggregateRoot, ConcurrencyStamp};

use super::isolation::IsolationLevel;
use super::r#trait::{StoreError, StoreTransaction, TransactionalStore};

type TxId = u64;

/// One committed state of a row; `None` marks a delete.
#[derive(Clone)]
struct RowVersion<E> {
    committed_at: u64,
    value: Option<E>,
}

/// What the committed row must look like for a pending write to apply.
#[derive(Clone)]
enum Precondition {
    Absent,
    Stamp(ConcurrencyStamp),
}

#[derive(Clone)]
struct PendingWrite<E> {
    value: Option<E>,
    precondition: Precondition,
}

struct Shared<E: AggregateRoot> {
    /// Committed versions per row, oldest first.
    rows: BTreeMap<E::Id, Vec<RowVersion<E>>>,
    /// Uncommitted writes, visible to read-uncommitted readers only.
    in_flight: BTreeMap<E::Id, Vec<(TxId, Option<E>)>>,
    /// Snapshot sequence of every open snapshot-based transaction.
    active_snapshots: BTreeMap<TxId, u64>,
    commit_seq: u64,
    next_tx: TxId,
    available: bool,
}

impl<E: AggregateRoot> Shared<E> {
    /// Forget everything an ending transaction left in shared state.
    fn release(&mut self, tx_id: TxId) {
        self.in_flight.retain(|_, writes| {
            writes.retain(|(owner, _)| *owner != tx_id);
            !writes.is_empty()
        });
        self.active_snapshots.remove(&tx_id);
    }
}

impl<E> Shared<E>
where
    E: AggregateRoot + Clone,
{
    fn latest_committed(&self, id: &E::Id) -> Option<&RowVersion<E>> {
        self.rows.get(id).and_then(|versions| versions.last())
    }

    fn committed_as_of(&self, id: &E::Id, seq: u64) -> Option<&RowVersion<E>> {
        self.rows
            .get(id)
            .and_then(|versions| versions.iter().rev().find(|v| v.committed_at <= seq))
    }

    fn newest_foreign_write(&self, id: &E::Id, tx_id: TxId) -> Option<&Option<E>> {
        self.in_flight
            .get(id)
            .and_then(|writes| writes.iter().rev().find(|(owner, _)| *owner != tx_id))
            .map(|(_, value)| value)
    }

    fn publish_in_flight(&mut self, tx_id: TxId, id: &E::Id, value: Option<E>) {
        let writes = self.in_flight.entry(id.clone()).or_default();
        writes.retain(|(owner, _)| *owner != tx_id);
        writes.push((tx_id, value));
    }

    /// Drop versions no open snapshot can still see, and the row itself once only
    /// a visible-to-all delete is left.
    fn prune(&mut self, id: &E::Id) {
        let horizon = self
            .active_snapshots
            .values()
            .copied()
            .min()
            .unwrap_or(self.commit_seq);

        let Some(versions) = self.rows.get_mut(id) else {
            return;
        };
        if let Some(keep_from) = versions.iter().rposition(|v| v.committed_at <= horizon) {
            versions.drain(..keep_from);
        }
        let deleted_for_all = matches!(
            versions.as_slice(),
            [only] if only.value.is_none() && only.committed_at <= horizon
        );
        if deleted_for_all {
            self.rows.remove(id);
        }
    }
}

fn lock<E: AggregateRoot>(
    shared: &Mutex<Shared<E>>,
) -> Result<MutexGuard<'_, Shared<E>>, StoreError> {
    shared
        .lock()
        .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
}

/// In-memory transactional store.
///
/// Intended for tests/dev. Emulates the observable behaviour of each
/// [`IsolationLevel`] (see the table in [`super::isolation`]) with multi-version
/// rows and commit-time validation; it never blocks, so conflicts a locking
/// engine would resolve by waiting surface as retryable errors instead.
///
/// Cloning yields another handle to the same data.
pub struct InMemoryStore<E: AggregateRoot> {
    shared: Arc<Mutex<Shared<E>>>,
}

impl<E: AggregateRoot> Clone for InMemoryStore<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: AggregateRoot> core::fmt::Debug for InMemoryStore<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl<E: AggregateRoot> Default for InMemoryStore<E> {
    fn default() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                rows: BTreeMap::new(),
                in_flight: BTreeMap::new(),
                active_snapshots: BTreeMap::new(),
                commit_seq: 0,
                next_tx: 1,
                available: true,
            })),
        }
    }
}

impl<E> InMemoryStore<E>
where
    E: AggregateRoot + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the connection to the store.
    ///
    /// While unavailable, every operation fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) -> Result<(), StoreError> {
        lock(&self.shared)?.available = available;
        Ok(())
    }

    /// Number of transactions committed so far.
    pub fn commit_count(&self) -> Result<u64, StoreError> {
        Ok(lock(&self.shared)?.commit_seq)
    }
}

#[async_trait]
impl<E> TransactionalStore<E> for InMemoryStore<E>
where
    E: AggregateRoot + Clone + Send + Sync + 'static,
{
    type Transaction = InMemoryTransaction<E>;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Transaction, StoreError> {
        let mut shared = lock(&self.shared)?;
        if !shared.available {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }

        let tx_id = shared.next_tx;
        shared.next_tx += 1;
        let snapshot = shared.commit_seq;
        if isolation.uses_transaction_snapshot() {
            shared.active_snapshots.insert(tx_id, snapshot);
        }

        Ok(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            tx_id,
            isolation,
            snapshot,
            observed: HashMap::new(),
            cached: HashMap::new(),
            writes: BTreeMap::new(),
            scanned: false,
            finished: false,
        })
    }
}

/// Transaction handed out by [`InMemoryStore`].
///
/// Writes are buffered locally and also published as in-flight so dirty readers
/// can see them; commit validates them against the latest committed state.
///
/// A read-uncommitted transaction may write back a row it saw dirty. Its stamp
/// precondition is then taken from the latest committed version, so an open
/// writer does not make it conflict.
pub struct InMemoryTransaction<E: AggregateRoot> {
    shared: Arc<Mutex<Shared<E>>>,
    tx_id: TxId,
    isolation: IsolationLevel,
    snapshot: u64,
    /// Commit sequence of the version each row was read at (0 = never existed).
    observed: HashMap<E::Id, u64>,
    /// Repeatable-read cache of first reads.
    cached: HashMap<E::Id, Option<E>>,
    writes: BTreeMap<E::Id, PendingWrite<E>>,
    /// A serializable transaction listed the whole table.
    scanned: bool,
    finished: bool,
}

impl<E: AggregateRoot> core::fmt::Debug for InMemoryTransaction<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("tx_id", &self.tx_id)
            .field("isolation", &self.isolation)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<E> InMemoryTransaction<E>
where
    E: AggregateRoot + Clone + Send + Sync + 'static,
{
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::TransactionClosed)
        } else {
            Ok(())
        }
    }

    fn visible(&mut self, shared: &Shared<E>, id: &E::Id) -> Option<E> {
        if let Some(write) = self.writes.get(id) {
            return write.value.clone();
        }

        match self.isolation {
            IsolationLevel::ReadUncommitted => {
                if let Some(dirty) = shared.newest_foreign_write(id, self.tx_id) {
                    return dirty.clone();
                }
                shared.latest_committed(id).and_then(|v| v.value.clone())
            }
            IsolationLevel::ReadCommitted => {
                shared.latest_committed(id).and_then(|v| v.value.clone())
            }
            IsolationLevel::RepeatableRead => {
                if let Some(first) = self.cached.get(id) {
                    return first.clone();
                }
                let version = shared.latest_committed(id);
                let value = version.and_then(|v| v.value.clone());
                self.observed
                    .insert(id.clone(), version.map(|v| v.committed_at).unwrap_or(0));
                self.cached.insert(id.clone(), value.clone());
                value
            }
            IsolationLevel::Serializable | IsolationLevel::Snapshot => {
                let version = shared.committed_as_of(id, self.snapshot);
                self.observed
                    .entry(id.clone())
                    .or_insert_with(|| version.map(|v| v.committed_at).unwrap_or(0));
                version.and_then(|v| v.value.clone())
            }
        }
    }

    /// Check a write against the latest committed row, at write time and again at commit.
    fn check_write(
        &self,
        shared: &Shared<E>,
        id: &E::Id,
        precondition: &Precondition,
    ) -> Result<(), StoreError> {
        let latest = shared.latest_committed(id);
        let latest_seq = latest.map(|v| v.committed_at).unwrap_or(0);

        match self.isolation {
            IsolationLevel::Snapshot if latest_seq > self.snapshot => {
                return Err(StoreError::WriteConflict(format!(
                    "row {id} was modified after the snapshot was taken"
                )));
            }
            IsolationLevel::Serializable if latest_seq > self.snapshot => {
                return Err(StoreError::SerializationFailure(format!(
                    "row {id} was modified by a concurrent transaction"
                )));
            }
            IsolationLevel::RepeatableRead => {
                if let Some(seen) = self.observed.get(id) {
                    if *seen != latest_seq {
                        return Err(StoreError::SerializationFailure(format!(
                            "row {id} changed since it was read"
                        )));
                    }
                }
            }
            _ => {}
        }

        let current = latest.and_then(|v| v.value.as_ref());
        match (precondition, current) {
            (Precondition::Absent, None) => Ok(()),
            (Precondition::Absent, Some(_)) => {
                Err(StoreError::Duplicate(format!("row {id} already exists")))
            }
            (Precondition::Stamp(expected), Some(row)) => expected
                .check(row.concurrency_stamp())
                .map_err(|e| StoreError::StampMismatch(format!("row {id}: {e}"))),
            (Precondition::Stamp(_), None) => Err(StoreError::StampMismatch(format!(
                "row {id} no longer exists"
            ))),
        }
    }

    fn validate_commit(&self, shared: &Shared<E>) -> Result<(), StoreError> {
        for (id, write) in &self.writes {
            self.check_write(shared, id, &write.precondition)?;
        }

        if self.isolation == IsolationLevel::Serializable {
            for id in self.observed.keys() {
                let latest_seq = shared.latest_committed(id).map(|v| v.committed_at).unwrap_or(0);
                if latest_seq > self.snapshot {
                    return Err(StoreError::SerializationFailure(format!(
                        "row {id} read by this transaction was changed concurrently"
                    )));
                }
            }

            if self.scanned {
                let changed = shared
                    .rows
                    .values()
                    .filter_map(|versions| versions.last())
                    .any(|v| v.committed_at > self.snapshot);
                if changed {
                    return Err(StoreError::SerializationFailure(
                        "table scanned by this transaction was changed concurrently".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Stamp precondition for a write based on a row read at this isolation level.
    fn stamp_precondition(
        &self,
        shared: &Shared<E>,
        id: &E::Id,
        original: &ConcurrencyStamp,
    ) -> Precondition {
        if self.isolation == IsolationLevel::ReadUncommitted {
            let read_dirty = matches!(
                shared.newest_foreign_write(id, self.tx_id),
                Some(Some(dirty)) if dirty.concurrency_stamp() == original
            );
            let committed = shared
                .latest_committed(id)
                .and_then(|v| v.value.as_ref())
                .map(|row| row.concurrency_stamp().clone());
            if let (true, Some(committed)) = (read_dirty, committed) {
                return Precondition::Stamp(committed);
            }
        }
        Precondition::Stamp(original.clone())
    }

    /// Record a write whose precondition was already checked against `shared`.
    fn stage(
        &mut self,
        shared: &mut Shared<E>,
        id: &E::Id,
        value: Option<E>,
        precondition: Precondition,
    ) {
        // A row written twice keeps the precondition of its first write.
        let precondition = match self.writes.get(id) {
            Some(existing) => existing.precondition.clone(),
            None => precondition,
        };
        shared.publish_in_flight(self.tx_id, id, value.clone());
        self.writes.insert(id.clone(), PendingWrite { value, precondition });
    }

    fn write_with_stamp(
        &mut self,
        id: &E::Id,
        value: Option<E>,
        original: &ConcurrencyStamp,
    ) -> Result<(), StoreError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let mut guard = lock(&shared)?;
        if !guard.available {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }

        let precondition = self.stamp_precondition(&guard, id, original);
        match self.writes.get(id) {
            Some(PendingWrite { value: Some(own), .. }) => {
                original
                    .check(own.concurrency_stamp())
                    .map_err(|e| StoreError::StampMismatch(format!("row {id}: {e}")))?;
            }
            Some(PendingWrite { value: None, .. }) => {
                return Err(StoreError::StampMismatch(format!(
                    "row {id} was deleted in this transaction"
                )));
            }
            None => self.check_write(&guard, id, &precondition)?,
        }

        self.stage(&mut guard, id, value, precondition);
        Ok(())
    }

    fn finish(&mut self, shared: &mut Shared<E>) {
        self.finished = true;
        shared.release(self.tx_id);
    }
}

#[async_trait]
impl<E> StoreTransaction<E> for InMemoryTransaction<E>
where
    E: AggregateRoot + Clone + Send + Sync + 'static,
{
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn get(&mut self, id: &E::Id) -> Result<Option<E>, StoreError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let guard = lock(&shared)?;
        if !guard.available {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        Ok(self.visible(&guard, id))
    }

    async fn list(&mut self) -> Result<Vec<E>, StoreError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let guard = lock(&shared)?;
        if !guard.available {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }

        let mut ids: BTreeSet<E::Id> = guard.rows.keys().cloned().collect();
        ids.extend(self.writes.keys().cloned());
        if self.isolation == IsolationLevel::ReadUncommitted {
            ids.extend(guard.in_flight.keys().cloned());
        }
        if self.isolation == IsolationLevel::Serializable {
            self.scanned = true;
        }

        Ok(ids
            .iter()
            .filter_map(|id| self.visible(&guard, id))
            .collect())
    }

    async fn insert(&mut self, entity: &E) -> Result<(), StoreError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let mut guard = lock(&shared)?;
        if !guard.available {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }

        let id = entity.id().clone();
        match self.writes.get(&id) {
            Some(PendingWrite { value: Some(_), .. }) => {
                return Err(StoreError::Duplicate(format!("row {id} already exists")));
            }
            Some(PendingWrite { value: None, .. }) => {}
            None => self.check_write(&guard, &id, &Precondition::Absent)?,
        }

        self.stage(&mut guard, &id, Some(entity.clone()), Precondition::Absent);
        Ok(())
    }

    async fn update(&mut self, entity: &E, original: &ConcurrencyStamp) -> Result<(), StoreError> {
        let id = entity.id().clone();
        self.write_with_stamp(&id, Some(entity.clone()), original)
    }

    async fn delete(&mut self, id: &E::Id, original: &ConcurrencyStamp) -> Result<(), StoreError> {
        self.write_with_stamp(id, None, original)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let mut guard = lock(&shared)?;

        let outcome = if guard.available {
            self.validate_commit(&guard)
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".to_string()))
        };
        self.finish(&mut guard);
        outcome?;

        if self.writes.is_empty() {
            return Ok(());
        }

        guard.commit_seq += 1;
        let seq = guard.commit_seq;
        let writes = std::mem::take(&mut self.writes);
        for (id, write) in writes {
            guard.rows.entry(id.clone()).or_default().push(RowVersion {
                committed_at: seq,
                value: write.value,
            });
            guard.prune(&id);
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let shared = Arc::clone(&self.shared);
        let mut guard = lock(&shared)?;
        self.finish(&mut guard);
        Ok(())
    }
}

impl<E: AggregateRoot> Drop for InMemoryTransaction<E> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut guard = match self.shared.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.release(self.tx_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isostock_core::Entity;
    use isostock_products::{Product, ProductId};
    use rust_decimal::Decimal;

    fn widget() -> Product {
        Product::create(ProductId::generate(), "Widget", Decimal::new(100, 0), 50).unwrap()
    }

    async fn seeded(product: &Product) -> InMemoryStore<Product> {
        let store = InMemoryStore::new();
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.insert(product).await.unwrap();
        tx.commit().await.unwrap();
        store
    }

    #[tokio::test]
    async fn committed_insert_is_visible() {
        let product = widget();
        let store = seeded(&product).await;

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert_eq!(tx.get(product.id()).await.unwrap(), Some(product.clone()));
        assert_eq!(tx.list().await.unwrap(), vec![product]);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let product = widget();
        let store = seeded(&product).await;

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let err = tx.insert(&product).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn stale_stamp_is_rejected_on_update() {
        let product = widget();
        let store = seeded(&product).await;

        let mut first = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let mut loaded = first.get(product.id()).await.unwrap().unwrap();
        let original = loaded.concurrency_stamp().clone();
        loaded.update_stock(10).unwrap();
        first.update(&loaded, &original).await.unwrap();
        first.commit().await.unwrap();

        let mut stale = product.clone();
        stale.update_stock(20).unwrap();
        let mut second = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let err = second
            .update(&stale, product.concurrency_stamp())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StampMismatch(_)));
    }

    #[tokio::test]
    async fn conflicting_commit_is_rejected() {
        let product = widget();
        let store = seeded(&product).await;
        let original = product.concurrency_stamp().clone();

        let mut a = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let mut b = store.begin(IsolationLevel::ReadCommitted).await.unwrap();

        let mut for_a = a.get(product.id()).await.unwrap().unwrap();
        let mut for_b = b.get(product.id()).await.unwrap().unwrap();
        for_a.update_stock(40).unwrap();
        for_b.update_stock(30).unwrap();

        a.update(&for_a, &original).await.unwrap();
        b.update(&for_b, &original).await.unwrap();
        a.commit().await.unwrap();

        let err = b.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::StampMismatch(_)));

        let mut check = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let stored = check.get(product.id()).await.unwrap().unwrap();
        assert_eq!(stored.stock_quantity(), 40);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let product = widget();
        let store = seeded(&product).await;

        {
            let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
            let mut changed = product.clone();
            changed.update_price(Decimal::new(1, 0)).unwrap();
            tx.update(&changed, product.concurrency_stamp()).await.unwrap();
        }

        let mut dirty = store.begin(IsolationLevel::ReadUncommitted).await.unwrap();
        let seen = dirty.get(product.id()).await.unwrap().unwrap();
        assert_eq!(seen.price().amount(), Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn delete_hides_row_and_checks_stamp() {
        let product = widget();
        let store = seeded(&product).await;

        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let stale = ConcurrencyStamp::new();
        assert!(matches!(
            tx.delete(product.id(), &stale).await.unwrap_err(),
            StoreError::StampMismatch(_)
        ));
        tx.delete(product.id(), product.concurrency_stamp()).await.unwrap();
        tx.commit().await.unwrap();

        let mut check = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        assert_eq!(check.get(product.id()).await.unwrap(), None);
        assert!(check.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rollback_commits_nothing() {
        let product = widget();
        let store = seeded(&product).await;

        let tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.commit_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let product = widget();
        let store = seeded(&product).await;
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();

        store.set_available(false).unwrap();
        assert!(matches!(
            tx.get(product.id()).await.unwrap_err(),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            store.begin(IsolationLevel::ReadCommitted).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true).unwrap();
        assert!(tx.get(product.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn old_versions_are_pruned_once_no_snapshot_needs_them() {
        let product = widget();
        let store = seeded(&product).await;

        let mut current = product.clone();
        for quantity in 1..=5 {
            let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
            let original = current.concurrency_stamp().clone();
            current.update_stock(quantity).unwrap();
            tx.update(&current, &original).await.unwrap();
            tx.commit().await.unwrap();
        }

        let guard = store.shared.lock().unwrap();
        assert_eq!(guard.rows.get(product.id()).map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn deleted_rows_are_forgotten_once_no_snapshot_needs_them() {
        let product = widget();
        let store = seeded(&product).await;

        let mut reader = store.begin(IsolationLevel::Snapshot).await.unwrap();
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.delete(product.id(), product.concurrency_stamp()).await.unwrap();
        tx.commit().await.unwrap();

        // The open snapshot still sees the row, so the tombstone stays.
        assert_eq!(reader.get(product.id()).await.unwrap(), Some(product.clone()));
        assert!(store.shared.lock().unwrap().rows.contains_key(product.id()));
        reader.rollback().await.unwrap();

        let other = widget();
        let mut tx = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        tx.insert(&other).await.unwrap();
        tx.delete(other.id(), other.concurrency_stamp()).await.unwrap();
        tx.commit().await.unwrap();

        let guard = store.shared.lock().unwrap();
        assert!(!guard.rows.contains_key(other.id()));
    }

    #[tokio::test]
    async fn read_uncommitted_write_back_ignores_open_writer() {
        let product = widget();
        let store = seeded(&product).await;

        let mut writer = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let mut pending = product.clone();
        pending.update_stock(40).unwrap();
        writer.update(&pending, product.concurrency_stamp()).await.unwrap();

        let mut dirty = store.begin(IsolationLevel::ReadUncommitted).await.unwrap();
        let mut seen = dirty.get(product.id()).await.unwrap().unwrap();
        assert_eq!(seen.stock_quantity(), 40);
        let original = seen.concurrency_stamp().clone();
        seen.update_stock(5).unwrap();
        dirty.update(&seen, &original).await.unwrap();
        dirty.commit().await.unwrap();

        assert!(matches!(
            writer.commit().await,
            Err(StoreError::StampMismatch(_))
        ));
        let mut check = store.begin(IsolationLevel::ReadCommitted).await.unwrap();
        let stored = check.get(product.id()).await.unwrap().unwrap();
        assert_eq!(stored.stock_quantity(), 5);
    }
}
