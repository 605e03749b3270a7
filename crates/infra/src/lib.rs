//! Infrastructure layer: transactional stores, isolation levels, conflict retry.

pub mod config;
pub mod product_service;
pub mod retry;
pub mod store;
pub mod updater;


pub use config::{ConfigError, ConnectError, StoreConfig, UpdaterConfig};
pub use product_service::{NewProduct, ProductService};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{
    ConflictKind, InMemoryStore, InMemoryTransaction, IsolationLevel, PostgresProductStore,
    PostgresTransaction, StoreError, StoreTransaction, TransactionalStore,
};
pub use updater::{
    AttemptOutcome, CancelHandle, CancellationSignal, ConflictRetryingUpdater, UpdateError,
    UpdatePhase, cancellation,
};
