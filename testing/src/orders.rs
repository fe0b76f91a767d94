//! In-memory order status store.

use crate::mocks::test_clock;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use stockbridge_core::environment::Clock;
use stockbridge_core::order::{
    OrderRecord, OrderStatus, OrderStatusStore, OrderStoreError, OrderStoreFuture,
};

/// Order statuses held in a map.
pub struct InMemoryOrderStatusStore {
    orders: Mutex<BTreeMap<String, OrderRecord>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOrderStatusStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOrderStatusStore {
    /// Create an empty store stamping changes with the fixed test clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty store with a custom clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            orders: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn orders(&self) -> MutexGuard<'_, BTreeMap<String, OrderRecord>> {
        self.orders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current status of an order, if known.
    #[must_use]
    pub fn status(&self, order_id: &str) -> Option<OrderStatus> {
        self.orders().get(order_id).map(|record| record.status)
    }

    /// Every stored order, ordered by id.
    #[must_use]
    pub fn all(&self) -> Vec<OrderRecord> {
        self.orders().values().cloned().collect()
    }
}

impl OrderStatusStore for InMemoryOrderStatusStore {
    fn insert_pending<'a>(&'a self, order_id: &'a str) -> OrderStoreFuture<'a, OrderRecord> {
        Box::pin(async move {
            let mut orders = self.orders();
            if orders.contains_key(order_id) {
                return Err(OrderStoreError::AlreadyExists(order_id.to_string()));
            }
            let record = OrderRecord {
                order_id: order_id.to_string(),
                status: OrderStatus::Pending,
                cancellation_reason: None,
                updated_at: self.clock.now(),
            };
            orders.insert(order_id.to_string(), record.clone());
            Ok(record)
        })
    }

    fn get<'a>(&'a self, order_id: &'a str) -> OrderStoreFuture<'a, Option<OrderRecord>> {
        Box::pin(async move { Ok(self.orders().get(order_id).cloned()) })
    }

    fn transition<'a>(
        &'a self,
        order_id: &'a str,
        to: OrderStatus,
        reason: Option<String>,
    ) -> OrderStoreFuture<'a, OrderRecord> {
        Box::pin(async move {
            let mut orders = self.orders();
            let record = orders
                .get_mut(order_id)
                .ok_or_else(|| OrderStoreError::NotFound(order_id.to_string()))?;
            if record.status != OrderStatus::Pending {
                return Err(OrderStoreError::InvalidTransition {
                    order_id: order_id.to_string(),
                    from: record.status,
                    to,
                });
            }
            record.status = to;
            record.cancellation_reason = reason;
            record.updated_at = self.clock.now();
            Ok(record.clone())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_orders_transition_once() {
        let store = InMemoryOrderStatusStore::new();
        store.insert_pending("o-1").await.unwrap();
        assert!(matches!(
            store.insert_pending("o-1").await,
            Err(OrderStoreError::AlreadyExists(_))
        ));

        let confirmed = store
            .transition("o-1", OrderStatus::Confirmed, None)
            .await
            .unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);

        assert_eq!(
            store
                .transition("o-1", OrderStatus::Cancelled, Some("late".into()))
                .await
                .unwrap_err(),
            OrderStoreError::InvalidTransition {
                order_id: "o-1".into(),
                from: OrderStatus::Confirmed,
                to: OrderStatus::Cancelled,
            }
        );
        assert_eq!(store.status("o-1"), Some(OrderStatus::Confirmed));
    }

    #[tokio::test]
    async fn unknown_orders_are_reported() {
        let store = InMemoryOrderStatusStore::new();
        assert_eq!(
            store
                .transition("ghost", OrderStatus::Confirmed, None)
                .await
                .unwrap_err(),
            OrderStoreError::NotFound("ghost".into())
        );
        assert!(store.get("ghost").await.unwrap().is_none());
    }
}
