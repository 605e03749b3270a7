//! Postgres-backed product store.
//!
//! Each transaction is a `sqlx` transaction whose isolation level is set with
//! `SET TRANSACTION ISOLATION LEVEL` right after `BEGIN`, following
//! [`POSTGRES_TRANSLATION`](super::isolation::POSTGRES_TRANSLATION). Optimistic
//! concurrency is enforced by the `WHERE concurrency_stamp = $n` guard on every
//! write.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database | `40001` | `SerializationFailure` | serializable / repeatable-read abort |
//! | Database | `40P01` | `SerializationFailure` | deadlock victim |
//! | Database | `23505` | `Duplicate` | insert of an existing id |
//! | Database | `08xxx`, `57P01`..`57P03` | `Unavailable` | connection lost, server shutting down |
//! | Database | any other | `Backend` | constraint violations, syntax, ... |
//! | Io, Tls, PoolTimedOut, PoolClosed, WorkerCrashed | N/A | `Unavailable` | transport failures |
//! | Other | N/A | `Backend` | decoding errors, ... |
//!
//! A guarded `UPDATE`/`DELETE` touching zero rows maps to `StampMismatch`.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use isostock_core::{AggregateId, AggregateRoot, ConcurrencyStamp};
use isostock_products::{Product, ProductId};

use super::isolation::IsolationLevel;
use super::r#trait::{StoreError, StoreTransaction, TransactionalStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id                UUID PRIMARY KEY,
    name              VARCHAR(128) NOT NULL,
    price             NUMERIC(18, 2) NOT NULL CHECK (price >= 0),
    stock_quantity    INTEGER NOT NULL CHECK (stock_quantity >= 0),
    concurrency_stamp VARCHAR(40) NOT NULL
)
"#;

/// Postgres-backed store for [`Product`].
///
/// Uses the SQLx connection pool, which is thread-safe; each transaction holds
/// one pooled connection until it is committed, rolled back or dropped.
#[derive(Debug, Clone)]
pub struct PostgresProductStore {
    pool: Arc<PgPool>,
}

impl PostgresProductStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `products` table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore<Product> for PostgresProductStore {
    type Transaction = PostgresTransaction;

    #[instrument(skip(self), fields(isolation = %isolation), err)]
    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Transaction, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let statement = format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.postgres().statement
        );
        sqlx::query(&statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_isolation", e))?;

        Ok(PostgresTransaction { tx, isolation })
    }
}

/// Transaction handed out by [`PostgresProductStore`].
///
/// Dropping it without commit returns the connection to the pool with the
/// transaction rolled back.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    isolation: IsolationLevel,
}

#[async_trait]
impl StoreTransaction<Product> for PostgresTransaction {
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    #[instrument(skip(self), fields(product_id = %id), err)]
    async fn get(&mut self, id: &ProductId) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, price, stock_quantity, concurrency_stamp
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id.0.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_product", e))?;

        row.as_ref().map(product_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list(&mut self) -> Result<Vec<Product>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, price, stock_quantity, concurrency_stamp
            FROM products
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("list_products", e))?;

        rows.iter().map(product_from_row).collect()
    }

    #[instrument(skip(self, entity), fields(product_id = %entity.id_typed()), err)]
    async fn insert(&mut self, entity: &Product) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, price, stock_quantity, concurrency_stamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entity.id_typed().0.as_uuid())
        .bind(entity.name())
        .bind(entity.price().amount())
        .bind(entity.stock_quantity())
        .bind(entity.concurrency_stamp().as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_product", e))?;
        Ok(())
    }

    #[instrument(skip(self, entity, original), fields(product_id = %entity.id_typed()), err)]
    async fn update(
        &mut self,
        entity: &Product,
        original: &ConcurrencyStamp,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE products
            SET name = $2, price = $3, stock_quantity = $4, concurrency_stamp = $5
            WHERE id = $1 AND concurrency_stamp = $6
            "#,
        )
        .bind(entity.id_typed().0.as_uuid())
        .bind(entity.name())
        .bind(entity.price().amount())
        .bind(entity.stock_quantity())
        .bind(entity.concurrency_stamp().as_str())
        .bind(original.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_product", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StampMismatch(format!(
                "product {} was modified or deleted concurrently (expected stamp {original})",
                entity.id_typed()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, original), fields(product_id = %id), err)]
    async fn delete(
        &mut self,
        id: &ProductId,
        original: &ConcurrencyStamp,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM products WHERE id = $1 AND concurrency_stamp = $2")
            .bind(id.0.as_uuid())
            .bind(original.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_product", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::StampMismatch(format!(
                "product {id} was modified or deleted concurrently (expected stamp {original})"
            )));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Backend(format!("failed to decode product row: {e}"));

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let name: String = row.try_get("name").map_err(decode)?;
    let price: Decimal = row.try_get("price").map_err(decode)?;
    let stock_quantity: i32 = row.try_get("stock_quantity").map_err(decode)?;
    let stamp: String = row.try_get("concurrency_stamp").map_err(decode)?;

    Product::restore(
        ProductId::new(AggregateId::from_uuid(id)),
        name,
        price,
        stock_quantity,
        ConcurrencyStamp::from_persisted(stamp),
    )
    .map_err(|e| StoreError::Backend(format!("stored product {id} violates invariants: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some(code) => classify_sqlstate(code, msg),
                None => StoreError::Backend(msg),
            }
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::WorkerCrashed => {
            StoreError::Unavailable(format!("connection worker crashed in {operation}"))
        }
        other => StoreError::Backend(format!("sqlx error in {operation}: {other}")),
    }
}

fn classify_sqlstate(code: &str, msg: String) -> StoreError {
    match code {
        "40001" | "40P01" => StoreError::SerializationFailure(msg),
        "23505" => StoreError::Duplicate(msg),
        "57P01" | "57P02" | "57P03" => StoreError::Unavailable(msg),
        c if c.starts_with("08") => StoreError::Unavailable(msg),
        _ => StoreError::Backend(msg),
    }
}
