//! Stock ledger on `products_stock`.

use crate::{LOCK_NOT_AVAILABLE, UNIQUE_VIOLATION, sqlstate};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{FromRow, Transaction};
use std::time::Duration;
use stockbridge_core::ledger::{LedgerFuture, lock_order};
use stockbridge_core::{Ledger, LedgerError, LockedRows, LockedWork, ProductId, StockRecord};

/// Default time to wait for a row lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, FromRow)]
struct StockRow {
    product_id: String,
    available_stock: i64,
    reserved_stock: i64,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StockRow> for StockRecord {
    type Error = LedgerError;

    fn try_from(row: StockRow) -> Result<Self, Self::Error> {
        let counter = |value: i64, column: &str| {
            u32::try_from(value).map_err(|_| {
                LedgerError::Storage(format!(
                    "{column} out of range for product {}: {value}",
                    row.product_id
                ))
            })
        };
        Ok(Self {
            available_stock: counter(row.available_stock, "available_stock")?,
            reserved_stock: counter(row.reserved_stock, "reserved_stock")?,
            product_id: ProductId::new(row.product_id),
            updated_at: row.updated_at,
        })
    }
}

fn storage(context: &'static str) -> impl Fn(sqlx::Error) -> LedgerError {
    move |e| match sqlstate(&e).as_deref() {
        Some(LOCK_NOT_AVAILABLE) => LedgerError::LockTimeout(format!("{context}: {e}")),
        _ => LedgerError::Storage(format!("{context}: {e}")),
    }
}

/// `PostgreSQL`-backed stock ledger.
///
/// Reservations run in one transaction: `SET LOCAL lock_timeout`, lock the
/// rows with `SELECT ... ORDER BY product_id FOR UPDATE`, apply the closure,
/// write back the rows it touched, commit. Any error rolls the whole
/// transaction back.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PostgresLedger {
    /// Create a ledger over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set how long a reservation waits for its row locks.
    #[must_use]
    pub const fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_locked(&self, product_ids: Vec<ProductId>, work: LockedWork) -> Result<(), LedgerError> {
        let keys: Vec<String> = lock_order(product_ids)
            .into_iter()
            .map(|id| id.as_str().to_string())
            .collect();

        let mut tx = self.pool.begin().await.map_err(storage("Failed to start transaction"))?;

        let result = self.locked(&mut tx, &keys, work).await;
        match result {
            Ok(written) => {
                tx.commit().await.map_err(storage("Failed to commit reservation"))?;
                metrics::counter!("ledger_transactions_total", "result" => "committed").increment(1);
                tracing::debug!(rows = keys.len(), written, "Ledger transaction committed");
                Ok(())
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed, connection will be discarded");
                }
                metrics::counter!("ledger_transactions_total", "result" => "rolled_back").increment(1);
                tracing::debug!(rows = keys.len(), error = %e, "Ledger transaction rolled back");
                Err(e)
            }
        }
    }

    async fn locked(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        keys: &[String],
        work: LockedWork,
    ) -> Result<usize, LedgerError> {
        // SET does not take bind parameters.
        let timeout_ms = self.lock_timeout.as_millis();
        sqlx::query(&format!("SET LOCAL lock_timeout = '{timeout_ms}ms'"))
            .execute(&mut **tx)
            .await
            .map_err(storage("Failed to set lock timeout"))?;

        let rows: Vec<StockRow> = sqlx::query_as(
            r"
            SELECT product_id, available_stock, reserved_stock, updated_at
            FROM products_stock
            WHERE product_id = ANY($1)
            ORDER BY product_id
            FOR UPDATE
            ",
        )
        .bind(keys)
        .fetch_all(&mut **tx)
        .await
        .map_err(storage("Failed to lock stock rows"))?;

        let records = rows
            .into_iter()
            .map(StockRecord::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let mut locked = LockedRows::new(records);

        work(&mut locked)?;

        let dirty = locked.into_dirty();
        for record in &dirty {
            sqlx::query(
                r"
                UPDATE products_stock
                SET available_stock = $2, reserved_stock = $3, updated_at = now()
                WHERE product_id = $1
                ",
            )
            .bind(record.product_id.as_str())
            .bind(i64::from(record.available_stock))
            .bind(i64::from(record.reserved_stock))
            .execute(&mut **tx)
            .await
            .map_err(storage("Failed to write stock row"))?;
        }
        Ok(dirty.len())
    }
}

impl Ledger for PostgresLedger {
    fn get<'a>(&'a self, product_id: &'a ProductId) -> LedgerFuture<'a, Option<StockRecord>> {
        Box::pin(async move {
            let row: Option<StockRow> = sqlx::query_as(
                "SELECT product_id, available_stock, reserved_stock, updated_at FROM products_stock WHERE product_id = $1",
            )
            .bind(product_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Failed to read stock row"))?;

            row.map(StockRecord::try_from).transpose()
        })
    }

    fn with_lock(&self, product_ids: Vec<ProductId>, work: LockedWork) -> LedgerFuture<'_, ()> {
        Box::pin(self.run_locked(product_ids, work))
    }

    fn create(&self, product_id: ProductId, available_stock: u32) -> LedgerFuture<'_, StockRecord> {
        Box::pin(async move {
            let row: StockRow = sqlx::query_as(
                r"
                INSERT INTO products_stock (product_id, available_stock, reserved_stock, updated_at)
                VALUES ($1, $2, 0, now())
                RETURNING product_id, available_stock, reserved_stock, updated_at
                ",
            )
            .bind(product_id.as_str())
            .bind(i64::from(available_stock))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) {
                    LedgerError::AlreadyExists(product_id.clone())
                } else {
                    LedgerError::Storage(format!("Failed to create stock row: {e}"))
                }
            })?;

            tracing::info!(product_id = %product_id, available_stock, "Stock record created");
            StockRecord::try_from(row)
        })
    }

    fn list(&self) -> LedgerFuture<'_, Vec<StockRecord>> {
        Box::pin(async move {
            let rows: Vec<StockRow> = sqlx::query_as(
                "SELECT product_id, available_stock, reserved_stock, updated_at FROM products_stock ORDER BY product_id",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(storage("Failed to list stock rows"))?;

            rows.into_iter().map(StockRecord::try_from).collect()
        })
    }

    fn set_available(&self, product_id: ProductId, available_stock: u32) -> LedgerFuture<'_, StockRecord> {
        Box::pin(async move {
            let row: Option<StockRow> = sqlx::query_as(
                r"
                UPDATE products_stock
                SET available_stock = $2, updated_at = now()
                WHERE product_id = $1
                RETURNING product_id, available_stock, reserved_stock, updated_at
                ",
            )
            .bind(product_id.as_str())
            .bind(i64::from(available_stock))
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Failed to update stock row"))?;

            let record = row
                .ok_or_else(|| LedgerError::NotFound(product_id.clone()))
                .and_then(StockRecord::try_from)?;
            tracing::info!(product_id = %product_id, available_stock, "Available stock set");
            Ok(record)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn row(available: i64, reserved: i64) -> StockRow {
        StockRow {
            product_id: "P".to_string(),
            available_stock: available,
            reserved_stock: reserved,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn rows_convert_to_records() {
        let record = StockRecord::try_from(row(7, 3)).unwrap();
        assert_eq!(record.product_id, ProductId::new("P"));
        assert_eq!((record.available_stock, record.reserved_stock), (7, 3));
    }

    #[test]
    fn out_of_range_counters_are_storage_errors() {
        assert!(matches!(StockRecord::try_from(row(-1, 0)), Err(LedgerError::Storage(_))));
        assert!(matches!(
            StockRecord::try_from(row(0, i64::from(u32::MAX) + 1)),
            Err(LedgerError::Storage(_))
        ));
    }
}
