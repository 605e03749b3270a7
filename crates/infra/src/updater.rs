//! Conflict-retrying read-modify-write over a [`TransactionalStore`].
//!
//! ## Update Flow
//!
//! ```text
//! update_field(id, mutation, isolation)
//!   ↓
//! 1. Begin a transaction at the requested isolation level
//!   ↓
//! 2. Read the entity (absent → NotFound, no retry)
//!   ↓
//! 3. Remember its stamp, apply the mutation (error → Validation, no retry)
//!   ↓
//! 4. Persist with the remembered stamp as concurrency token
//!   ↓
//! 5. Commit
//! ```
//!
//! A conflict at step 4 or 5 ([`ConflictKind`]) rolls the attempt back and the whole
//! sequence starts again from step 1 against fresh state, after the policy's backoff.
//! Every other failure ends the call immediately.
//!
//! Each attempt is reduced to an [`AttemptOutcome`]; [`ConflictRetryingUpdater::retry`]
//! is the bounded loop consuming them.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, field, instrument, warn, Span};

use isostock_core::{AggregateRoot, DomainError, DomainResult};

use crate::config::UpdaterConfig;
use crate::retry::RetryPolicy;
use crate::store::{ConflictKind, IsolationLevel, StoreError, StoreTransaction, TransactionalStore};

/// Where a single update call currently is.
///
/// `Idle → TransactionOpen → Mutated → Committing → {Committed | ConflictDetected}`;
/// `ConflictDetected` loops back to `Idle` until the attempt budget runs out, then `Failed`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    TransactionOpen,
    Mutated,
    Committing,
    Committed,
    ConflictDetected,
    Failed,
}

impl UpdatePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UpdatePhase::Committed | UpdatePhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::TransactionOpen => "transaction_open",
            UpdatePhase::Mutated => "mutated",
            UpdatePhase::Committing => "committing",
            UpdatePhase::Committed => "committed",
            UpdatePhase::ConflictDetected => "conflict_detected",
            UpdatePhase::Failed => "failed",
        }
    }
}

impl core::fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// The entity does not exist. Never retried.
    #[error("entity {id} not found")]
    NotFound { id: String },

    /// Every attempt ended in a concurrency conflict.
    #[error("still conflicting after {attempts} attempts (last: {last})")]
    ConflictExhausted { attempts: u32, last: ConflictKind },

    /// The mutation was rejected by the domain. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The store could not be reached. Never retried.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Cancelled between attempts.
    #[error("cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },

    /// Any other store failure. Never retried.
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for UpdateError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(msg) => UpdateError::StoreUnavailable(msg),
            other => UpdateError::Store(other),
        }
    }
}

impl From<DomainError> for UpdateError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => UpdateError::Validation(msg),
            DomainError::InvalidId(msg) => UpdateError::Validation(msg),
            DomainError::Conflict(msg) => UpdateError::Store(StoreError::StampMismatch(msg)),
        }
    }
}

/// Result of one attempt, as seen by the retry loop.
#[derive(Debug)]
pub enum AttemptOutcome<T> {
    Committed(T),
    Retryable(ConflictKind),
    Fatal(UpdateError),
}

impl<T> AttemptOutcome<T> {
    pub fn from_store_error(err: StoreError) -> Self {
        match err.conflict_kind() {
            Some(kind) => AttemptOutcome::Retryable(kind),
            None => AttemptOutcome::Fatal(err.into()),
        }
    }

    /// A stale stamp reported by the domain is a conflict like any other.
    pub fn from_domain_error(err: DomainError) -> Self {
        if err.is_conflict() {
            AttemptOutcome::Retryable(ConflictKind::StampMismatch)
        } else {
            AttemptOutcome::Fatal(err.into())
        }
    }
}

/// Create a linked cancel handle / signal pair.
pub fn cancellation() -> (CancelHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancellationSignal { rx })
}

/// Requests cancellation of every update observing the paired [`CancellationSignal`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cooperative cancellation, checked before each attempt and during backoff.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if every
    /// [`CancelHandle`] is dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Single-entity read-modify-write that tolerates lost-update conflicts.
///
/// Holds no locks of its own: the store is the only shared state, so one updater can
/// serve any number of concurrent tasks.
#[derive(Debug, Clone)]
pub struct ConflictRetryingUpdater<S> {
    store: S,
    policy: RetryPolicy,
    default_isolation: IsolationLevel,
}

impl<S> ConflictRetryingUpdater<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            default_isolation: IsolationLevel::default(),
        }
    }

    pub fn from_config(store: S, config: &UpdaterConfig) -> Self {
        Self::new(store, config.retry.clone()).with_default_isolation(config.default_isolation)
    }

    pub fn with_default_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.default_isolation = isolation;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    /// Run `op` until it commits, fails fatally, or the attempt budget is spent.
    ///
    /// `op` receives the 1-indexed attempt number. Cancellation is observed before each
    /// attempt and while sleeping between attempts, never while one is running.
    pub async fn retry<T, Op, Fut>(
        &self,
        cancel: Option<&CancellationSignal>,
        mut op: Op,
    ) -> Result<T, UpdateError>
    where
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if cancel.is_some_and(CancellationSignal::is_cancelled) {
                debug!(attempts = attempt, "update cancelled before attempt");
                return Err(UpdateError::Cancelled { attempts: attempt });
            }

            attempt += 1;
            debug!(attempt, phase = %UpdatePhase::Idle, "starting attempt");

            let kind = match op(attempt).await {
                AttemptOutcome::Committed(value) => {
                    debug!(attempt, phase = %UpdatePhase::Committed, "attempt committed");
                    return Ok(value);
                }
                AttemptOutcome::Fatal(err) => {
                    debug!(attempt, phase = %UpdatePhase::Failed, error = %err, "attempt failed");
                    return Err(err);
                }
                AttemptOutcome::Retryable(kind) => kind,
            };

            if !self.policy.should_retry(attempt) {
                error!(
                    attempts = attempt,
                    conflict = %kind,
                    phase = %UpdatePhase::Failed,
                    "conflict retries exhausted"
                );
                return Err(UpdateError::ConflictExhausted {
                    attempts: attempt,
                    last: kind,
                });
            }

            let delay = self.policy.backoff_after(attempt);
            warn!(
                attempt,
                conflict = %kind,
                delay_ms = delay.as_millis() as u64,
                phase = %UpdatePhase::ConflictDetected,
                "conflict detected, retrying"
            );

            match cancel {
                Some(signal) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signal.cancelled() => {
                            debug!(attempts = attempt, "update cancelled during backoff");
                            return Err(UpdateError::Cancelled { attempts: attempt });
                        }
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    /// Apply `mutation` to the entity `id` and commit it, retrying on conflicts.
    ///
    /// `isolation` defaults to the updater's configured level. Returns the committed state.
    #[instrument(skip_all, fields(id = %id, isolation = field::Empty), err)]
    pub async fn update_field<E, F>(
        &self,
        id: &E::Id,
        mutation: F,
        isolation: Option<IsolationLevel>,
    ) -> Result<E, UpdateError>
    where
        S: TransactionalStore<E>,
        E: AggregateRoot + Send + Sync + 'static,
        F: Fn(&mut E) -> DomainResult<()> + Send + Sync,
    {
        self.run::<E, F>(id, &mutation, isolation, None).await
    }

    /// [`update_field`](Self::update_field), giving up with [`UpdateError::Cancelled`] once
    /// `cancel` fires.
    #[instrument(skip_all, fields(id = %id, isolation = field::Empty), err)]
    pub async fn update_field_cancellable<E, F>(
        &self,
        id: &E::Id,
        mutation: F,
        isolation: Option<IsolationLevel>,
        cancel: &CancellationSignal,
    ) -> Result<E, UpdateError>
    where
        S: TransactionalStore<E>,
        E: AggregateRoot + Send + Sync + 'static,
        F: Fn(&mut E) -> DomainResult<()> + Send + Sync,
    {
        self.run::<E, F>(id, &mutation, isolation, Some(cancel)).await
    }

    async fn run<E, F>(
        &self,
        id: &E::Id,
        mutation: &F,
        isolation: Option<IsolationLevel>,
        cancel: Option<&CancellationSignal>,
    ) -> Result<E, UpdateError>
    where
        S: TransactionalStore<E>,
        E: AggregateRoot + Send + Sync + 'static,
        F: Fn(&mut E) -> DomainResult<()> + Send + Sync,
    {
        let isolation = isolation.unwrap_or(self.default_isolation);
        Span::current().record("isolation", field::display(isolation));

        self.retry(cancel, |attempt| {
            self.attempt_update::<E, F>(id, mutation, isolation, attempt)
        })
        .await
    }

    async fn attempt_update<E, F>(
        &self,
        id: &E::Id,
        mutation: &F,
        isolation: IsolationLevel,
        attempt: u32,
    ) -> AttemptOutcome<E>
    where
        S: TransactionalStore<E>,
        E: AggregateRoot + Send + Sync + 'static,
        F: Fn(&mut E) -> DomainResult<()> + Send + Sync,
    {
        let mut tx = match self.store.begin(isolation).await {
            Ok(tx) => tx,
            Err(err) => return AttemptOutcome::from_store_error(err),
        };
        debug!(attempt, phase = %UpdatePhase::TransactionOpen, "transaction open");

        let mut entity = match tx.get(id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => {
                rollback_quietly::<E, _>(tx).await;
                return AttemptOutcome::Fatal(UpdateError::NotFound { id: id.to_string() });
            }
            Err(err) => {
                rollback_quietly::<E, _>(tx).await;
                return AttemptOutcome::from_store_error(err);
            }
        };

        let original = entity.concurrency_stamp().clone();
        if let Err(err) = mutation(&mut entity) {
            rollback_quietly::<E, _>(tx).await;
            return AttemptOutcome::from_domain_error(err);
        }
        debug!(attempt, phase = %UpdatePhase::Mutated, stamp = %original, "mutation applied");

        if let Err(err) = tx.update(&entity, &original).await {
            rollback_quietly::<E, _>(tx).await;
            return AttemptOutcome::from_store_error(err);
        }

        debug!(attempt, phase = %UpdatePhase::Committing, "committing");
        match tx.commit().await {
            Ok(()) => AttemptOutcome::Committed(entity),
            Err(err) => AttemptOutcome::from_store_error(err),
        }
    }
}

/// Roll back, logging instead of failing: the attempt already has an outcome.
pub(crate) async fn rollback_quietly<E, T>(tx: T)
where
    E: AggregateRoot + Send + Sync + 'static,
    T: StoreTransaction<E>,
{
    if let Err(err) = tx.rollback().await {
        debug!(error = %err, "rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::exponential(max_attempts, Duration::from_millis(1), Duration::from_millis(5))
    }

    fn updater(max_attempts: u32) -> ConflictRetryingUpdater<()> {
        ConflictRetryingUpdater::new((), fast_policy(max_attempts))
    }

    #[test]
    fn only_committed_and_failed_are_terminal() {
        assert!(UpdatePhase::Committed.is_terminal());
        assert!(UpdatePhase::Failed.is_terminal());
        assert!(!UpdatePhase::ConflictDetected.is_terminal());
        assert!(!UpdatePhase::Idle.is_terminal());
    }

    #[test]
    fn store_errors_map_to_update_errors() {
        assert_eq!(
            UpdateError::from(StoreError::Unavailable("down".into())),
            UpdateError::StoreUnavailable("down".into())
        );
        assert_eq!(
            UpdateError::from(StoreError::Duplicate("x".into())),
            UpdateError::Store(StoreError::Duplicate("x".into()))
        );
    }

    #[test]
    fn domain_conflicts_are_retryable() {
        assert!(matches!(
            AttemptOutcome::<()>::from_domain_error(DomainError::conflict("stale")),
            AttemptOutcome::Retryable(ConflictKind::StampMismatch)
        ));
        assert!(matches!(
            AttemptOutcome::<()>::from_domain_error(DomainError::validation("negative")),
            AttemptOutcome::Fatal(UpdateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn retry_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = updater(3)
            .retry(None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { AttemptOutcome::Retryable(ConflictKind::WriteConflict) }
            })
            .await;

        assert_eq!(
            result,
            Err(UpdateError::ConflictExhausted {
                attempts: 3,
                last: ConflictKind::WriteConflict
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_sleeps_the_policy_backoff_between_attempts() {
        let policy =
            RetryPolicy::exponential(3, Duration::from_millis(100), Duration::from_secs(5));
        let slow = ConflictRetryingUpdater::new((), policy.clone());
        let started = tokio::time::Instant::now();
        let mut offsets = Vec::new();

        let result: Result<(), _> = slow
            .retry(None, |_| {
                offsets.push(started.elapsed());
                async { AttemptOutcome::Retryable(ConflictKind::StampMismatch) }
            })
            .await;

        assert!(matches!(result, Err(UpdateError::ConflictExhausted { attempts: 3, .. })));
        let first_gap = policy.backoff_after(1);
        let second_gap = policy.backoff_after(2);
        assert_eq!(first_gap, Duration::from_millis(200));
        assert_eq!(second_gap, Duration::from_millis(400));
        assert_eq!(offsets, vec![Duration::ZERO, first_gap, first_gap + second_gap]);
    }

    #[tokio::test]
    async fn retry_passes_attempt_numbers_and_returns_value() {
        let result = updater(3)
            .retry(None, |attempt| async move {
                if attempt < 2 {
                    AttemptOutcome::Retryable(ConflictKind::StampMismatch)
                } else {
                    AttemptOutcome::Committed(attempt)
                }
            })
            .await;

        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn fatal_outcome_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = updater(3)
            .retry(None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { AttemptOutcome::Fatal(UpdateError::Validation("bad".into())) }
            })
            .await;

        assert_eq!(result, Err(UpdateError::Validation("bad".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_signal_prevents_first_attempt() {
        let (handle, signal) = cancellation();
        handle.cancel();

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = updater(3)
            .retry(Some(&signal), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { AttemptOutcome::Committed(()) }
            })
            .await;

        assert_eq!(result, Err(UpdateError::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let (handle, signal) = cancellation();
        let slow = ConflictRetryingUpdater::new(
            (),
            RetryPolicy::fixed(3, Duration::from_secs(30)),
        );

        let result: Result<(), _> = slow
            .retry(Some(&signal), |_| {
                handle.cancel();
                async { AttemptOutcome::Retryable(ConflictKind::SerializationFailure) }
            })
            .await;

        assert_eq!(result, Err(UpdateError::Cancelled { attempts: 1 }));
    }

    #[tokio::test]
    async fn dropped_handle_never_cancels() {
        let (handle, signal) = cancellation();
        drop(handle);

        assert!(!signal.is_cancelled());
        let result = updater(2)
            .retry(Some(&signal), |_| async { AttemptOutcome::Committed(7) })
            .await;
        assert_eq!(result, Ok(7));
    }
}
