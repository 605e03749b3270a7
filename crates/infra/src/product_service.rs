//! Product use cases on top of a [`TransactionalStore`].
//!
//! Reads run in their own transaction, rolled back once the data is in hand. Every
//! mutation goes through the [`ConflictRetryingUpdater`], so each one carries the same
//! retry contract.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use isostock_core::AggregateRoot;
use isostock_products::{Product, ProductFieldsUpdate, ProductId};

use crate::config::UpdaterConfig;
use crate::store::{IsolationLevel, StoreTransaction, TransactionalStore};
use crate::updater::{AttemptOutcome, ConflictRetryingUpdater, UpdateError, rollback_quietly};

/// Input for [`ProductService::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProduct {
    pub name: String,
    pub price: Decimal,
    pub stock_quantity: i32,
}

#[derive(Debug, Clone)]
pub struct ProductService<S> {
    updater: ConflictRetryingUpdater<S>,
}

impl<S> ProductService<S>
where
    S: TransactionalStore<Product>,
{
    pub fn new(store: S, config: &UpdaterConfig) -> Self {
        Self {
            updater: ConflictRetryingUpdater::from_config(store, config),
        }
    }

    pub fn updater(&self) -> &ConflictRetryingUpdater<S> {
        &self.updater
    }

    #[instrument(skip(self, input), fields(name = %input.name), err)]
    pub async fn create(&self, input: NewProduct) -> Result<Product, UpdateError> {
        let product = Product::create(
            ProductId::generate(),
            input.name,
            input.price,
            input.stock_quantity,
        )?;

        let mut tx = self
            .updater
            .store()
            .begin(self.updater.default_isolation())
            .await?;
        if let Err(err) = tx.insert(&product).await {
            rollback_quietly::<Product, _>(tx).await;
            return Err(err.into());
        }
        tx.commit().await?;

        Ok(product)
    }

    pub async fn get(&self, id: ProductId) -> Result<Product, UpdateError> {
        self.get_with_isolation(id, self.updater.default_isolation())
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_with_isolation(
        &self,
        id: ProductId,
        isolation: IsolationLevel,
    ) -> Result<Product, UpdateError> {
        let mut tx = self.updater.store().begin(isolation).await?;
        let found = tx.get(&id).await;
        rollback_quietly::<Product, _>(tx).await;

        found?.ok_or_else(|| UpdateError::NotFound { id: id.to_string() })
    }

    pub async fn list(&self) -> Result<Vec<Product>, UpdateError> {
        self.get_all_with_isolation(self.updater.default_isolation())
            .await
    }

    /// Every product, including changes other transactions have not committed yet
    /// (on backends that expose them).
    pub async fn get_all_read_uncommitted(&self) -> Result<Vec<Product>, UpdateError> {
        self.get_all_with_isolation(IsolationLevel::ReadUncommitted)
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_all_with_isolation(
        &self,
        isolation: IsolationLevel,
    ) -> Result<Vec<Product>, UpdateError> {
        let mut tx = self.updater.store().begin(isolation).await?;
        let products = tx.list().await;
        rollback_quietly::<Product, _>(tx).await;

        Ok(products?)
    }

    /// Delete a product, retrying when it changes between the read and the delete.
    #[instrument(skip(self), err)]
    pub async fn delete(&self, id: ProductId) -> Result<(), UpdateError> {
        let isolation = self.updater.default_isolation();
        self.updater
            .retry(None, |_| self.attempt_delete(id, isolation))
            .await
    }

    async fn attempt_delete(&self, id: ProductId, isolation: IsolationLevel) -> AttemptOutcome<()> {
        let mut tx = match self.updater.store().begin(isolation).await {
            Ok(tx) => tx,
            Err(err) => return AttemptOutcome::from_store_error(err),
        };

        let stamp = match tx.get(&id).await {
            Ok(Some(product)) => product.concurrency_stamp().clone(),
            Ok(None) => {
                rollback_quietly::<Product, _>(tx).await;
                return AttemptOutcome::Fatal(UpdateError::NotFound { id: id.to_string() });
            }
            Err(err) => {
                rollback_quietly::<Product, _>(tx).await;
                return AttemptOutcome::from_store_error(err);
            }
        };

        if let Err(err) = tx.delete(&id, &stamp).await {
            rollback_quietly::<Product, _>(tx).await;
            return AttemptOutcome::from_store_error(err);
        }

        match tx.commit().await {
            Ok(()) => AttemptOutcome::Committed(()),
            Err(err) => AttemptOutcome::from_store_error(err),
        }
    }

    pub async fn update_stock(
        &self,
        id: ProductId,
        quantity: i32,
        isolation: Option<IsolationLevel>,
    ) -> Result<Product, UpdateError> {
        self.updater
            .update_field::<Product, _>(&id, move |p| p.update_stock(quantity), isolation)
            .await
    }

    pub async fn update_price(
        &self,
        id: ProductId,
        price: Decimal,
        isolation: Option<IsolationLevel>,
    ) -> Result<Product, UpdateError> {
        self.updater
            .update_field::<Product, _>(&id, move |p| p.update_price(price), isolation)
            .await
    }

    /// Apply several field changes in one transaction, all or nothing.
    pub async fn update_with_isolation(
        &self,
        id: ProductId,
        fields: ProductFieldsUpdate,
        isolation: Option<IsolationLevel>,
    ) -> Result<Product, UpdateError> {
        if fields.is_empty() {
            return Err(UpdateError::Validation(
                "update must set at least one field".to_string(),
            ));
        }

        self.updater
            .update_field::<Product, _>(&id, move |p| p.apply_fields(&fields), isolation)
            .await
    }

    /// Set the stock of several products. Each one is updated (and retried) on its own;
    /// results come back in input order.
    pub async fn update_stock_many(
        &self,
        items: &[(ProductId, i32)],
        isolation: Option<IsolationLevel>,
    ) -> Vec<Result<Product, UpdateError>> {
        let mut results = Vec::with_capacity(items.len());
        for &(id, quantity) in items {
            results.push(self.update_stock(id, quantity, isolation).await);
        }
        results
    }
}
