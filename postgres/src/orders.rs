//! Order statuses on `orders_status`.

use crate::{UNIQUE_VIOLATION, sqlstate};
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::postgres::PgPool;
use stockbridge_core::order::{
    OrderRecord, OrderStatus, OrderStatusStore, OrderStoreError, OrderStoreFuture,
};

#[derive(Debug, FromRow)]
struct OrderRow {
    order_id: String,
    status: String,
    cancellation_reason: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for OrderRecord {
    type Error = OrderStoreError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let status = OrderStatus::parse(&row.status).ok_or_else(|| {
            OrderStoreError::Storage(format!("Invalid order status: {}", row.status))
        })?;
        Ok(Self {
            order_id: row.order_id,
            status,
            cancellation_reason: row.cancellation_reason,
            updated_at: row.updated_at,
        })
    }
}

fn storage(context: &'static str) -> impl Fn(sqlx::Error) -> OrderStoreError {
    move |e| OrderStoreError::Storage(format!("{context}: {e}"))
}

/// `PostgreSQL`-backed order status store.
///
/// Transitions are a single conditional `UPDATE ... WHERE status = 'PENDING'`,
/// so two outcomes racing for the same order cannot both apply.
#[derive(Clone)]
pub struct PostgresOrderStatusStore {
    pool: PgPool,
}

impl PostgresOrderStatusStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, order_id: &str) -> Result<Option<OrderRecord>, OrderStoreError> {
        let row: Option<OrderRow> = sqlx::query_as(
            "SELECT order_id, status, cancellation_reason, updated_at FROM orders_status WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage("Failed to read order"))?;

        row.map(OrderRecord::try_from).transpose()
    }
}

impl OrderStatusStore for PostgresOrderStatusStore {
    fn insert_pending<'a>(&'a self, order_id: &'a str) -> OrderStoreFuture<'a, OrderRecord> {
        Box::pin(async move {
            let row: OrderRow = sqlx::query_as(
                r"
                INSERT INTO orders_status (order_id, status, updated_at)
                VALUES ($1, 'PENDING', now())
                RETURNING order_id, status, cancellation_reason, updated_at
                ",
            )
            .bind(order_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if sqlstate(&e).as_deref() == Some(UNIQUE_VIOLATION) {
                    OrderStoreError::AlreadyExists(order_id.to_string())
                } else {
                    OrderStoreError::Storage(format!("Failed to insert order: {e}"))
                }
            })?;

            OrderRecord::try_from(row)
        })
    }

    fn get<'a>(&'a self, order_id: &'a str) -> OrderStoreFuture<'a, Option<OrderRecord>> {
        Box::pin(self.fetch(order_id))
    }

    fn transition<'a>(
        &'a self,
        order_id: &'a str,
        to: OrderStatus,
        reason: Option<String>,
    ) -> OrderStoreFuture<'a, OrderRecord> {
        Box::pin(async move {
            let updated: Option<OrderRow> = sqlx::query_as(
                r"
                UPDATE orders_status
                SET status = $2, cancellation_reason = $3, updated_at = now()
                WHERE order_id = $1 AND status = 'PENDING'
                RETURNING order_id, status, cancellation_reason, updated_at
                ",
            )
            .bind(order_id)
            .bind(to.as_str())
            .bind(reason)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage("Failed to update order"))?;

            if let Some(row) = updated {
                return OrderRecord::try_from(row);
            }

            // Nothing matched: either the order is unknown or no longer pending.
            match self.fetch(order_id).await? {
                None => Err(OrderStoreError::NotFound(order_id.to_string())),
                Some(current) => Err(OrderStoreError::InvalidTransition {
                    order_id: order_id.to_string(),
                    from: current.status,
                    to,
                }),
            }
        })
    }
}
