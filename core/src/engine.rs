//! Reservation engine.
//!
//! Two operations, used back to back by the consumer:
//!
//! - [`ReservationEngine::validate_availability`] is an unlocked fast path. It
//!   scans items in request order and stops at the first one that cannot be
//!   satisfied, producing the reason that goes on the rejection.
//! - [`ReservationEngine::reserve`] is authoritative. It locks every row of the
//!   request (sorted) and re-checks each item inside the transaction, so a
//!   concurrent reservation that won the race between the two calls turns into
//!   an `InsufficientStock` here instead of an oversell.

use crate::ledger::{Ledger, LedgerError, LockedRows, lock_order};
use crate::reservation::ReservationItem;
use crate::stock::ProductId;
use std::sync::Arc;
use thiserror::Error;

/// Result of the availability pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// Every item could be reserved at the time of the check
    Available,
    /// The first item that could not be reserved
    Unavailable {
        /// Product that failed the check
        product_id: ProductId,
        /// Human-readable reason
        reason: String,
    },
}

impl Availability {
    /// Whether every item passed.
    #[must_use]
    pub const fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    /// Reason for unavailability, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Available => None,
            Self::Unavailable { reason, .. } => Some(reason),
        }
    }
}

/// Errors returned by the reservation engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// No stock record exists for the product
    #[error("Product {0} not found in inventory")]
    ProductNotFound(ProductId),

    /// The product ran short inside the transaction
    #[error("Insufficient stock for product {product_id}. Available: {available}, Requested: {requested}")]
    InsufficientStock {
        /// Product that ran short
        product_id: ProductId,
        /// Units available under the lock
        available: u32,
        /// Units requested
        requested: u32,
    },

    /// A line asked for zero units
    #[error("Invalid quantity 0 for product {0}")]
    InvalidQuantity(ProductId),

    /// The ledger transaction itself failed (lock timeout, store error)
    #[error("{0}")]
    Transaction(LedgerError),
}

impl ReservationError {
    /// Whether the request was rejected on its merits rather than by a fault.
    #[must_use]
    pub const fn is_business_rejection(&self) -> bool {
        !matches!(self, Self::Transaction(_))
    }
}

impl From<LedgerError> for ReservationError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(product_id) => Self::ProductNotFound(product_id),
            LedgerError::InsufficientStock {
                product_id,
                available,
                requested,
            } => Self::InsufficientStock {
                product_id,
                available,
                requested,
            },
            LedgerError::InvalidQuantity { product_id } => Self::InvalidQuantity(product_id),
            other => Self::Transaction(other),
        }
    }
}

/// Validates and commits reservations against a [`Ledger`].
#[derive(Clone)]
pub struct ReservationEngine {
    ledger: Arc<dyn Ledger>,
}

impl ReservationEngine {
    /// Create an engine over a ledger.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self { ledger }
    }

    /// The ledger this engine writes to.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Check, without locking, whether every item could be reserved.
    ///
    /// Stops at the first failing item; later items are not read.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::Transaction`] if the ledger cannot be read.
    pub async fn validate_availability(
        &self,
        items: &[ReservationItem],
    ) -> Result<Availability, ReservationError> {
        for item in items {
            if item.quantity == 0 {
                return Ok(unavailable(
                    &item.product_id,
                    &ReservationError::InvalidQuantity(item.product_id.clone()),
                ));
            }

            let record = self
                .ledger
                .get(&item.product_id)
                .await
                .map_err(ReservationError::Transaction)?;

            match record {
                None => {
                    return Ok(unavailable(
                        &item.product_id,
                        &ReservationError::ProductNotFound(item.product_id.clone()),
                    ));
                }
                Some(record) if !record.can_reserve(item.quantity) => {
                    return Ok(unavailable(
                        &item.product_id,
                        &ReservationError::InsufficientStock {
                            product_id: item.product_id.clone(),
                            available: record.available_stock,
                            requested: item.quantity,
                        },
                    ));
                }
                Some(_) => {}
            }
        }

        Ok(Availability::Available)
    }

    /// Reserve every item in one locked transaction.
    ///
    /// Either all items are moved from available to reserved, or none are.
    ///
    /// # Errors
    ///
    /// - [`ReservationError::ProductNotFound`], [`ReservationError::InsufficientStock`]
    ///   or [`ReservationError::InvalidQuantity`] for the first failing item
    /// - [`ReservationError::Transaction`] if the ledger transaction fails
    pub async fn reserve(&self, items: &[ReservationItem]) -> Result<(), ReservationError> {
        let product_ids = lock_order(items.iter().map(|i| i.product_id.clone()).collect());
        let lines = items.to_vec();

        tracing::debug!(products = product_ids.len(), "Reserving under row locks");

        self.ledger
            .with_lock(
                product_ids,
                Box::new(move |rows: &mut LockedRows| {
                    for line in &lines {
                        rows.get_mut(&line.product_id)?.reserve(line.quantity)?;
                    }
                    Ok(())
                }),
            )
            .await
            .map_err(ReservationError::from)
    }
}

fn unavailable(product_id: &ProductId, err: &ReservationError) -> Availability {
    Availability::Unavailable {
        product_id: product_id.clone(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerFuture, LockedWork};
    use crate::stock::StockRecord;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Single-threaded ledger good enough for engine unit tests.
    #[derive(Default)]
    struct MapLedger {
        rows: Mutex<BTreeMap<ProductId, StockRecord>>,
        reads: AtomicUsize,
        locked: Mutex<Vec<Vec<ProductId>>>,
    }

    impl MapLedger {
        fn with(rows: &[(&str, u32)]) -> Arc<Self> {
            let ledger = Self::default();
            {
                let mut map = ledger.rows.lock().unwrap();
                for (id, available) in rows {
                    map.insert(
                        ProductId::new(*id),
                        StockRecord::new(ProductId::new(*id), *available, Utc::now()),
                    );
                }
            }
            Arc::new(ledger)
        }

        fn row(&self, id: &str) -> StockRecord {
            self.rows.lock().unwrap()[&ProductId::new(id)].clone()
        }
    }

    impl Ledger for MapLedger {
        fn get<'a>(&'a self, product_id: &'a ProductId) -> LedgerFuture<'a, Option<StockRecord>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            let row = self.rows.lock().unwrap().get(product_id).cloned();
            Box::pin(async move { Ok(row) })
        }

        fn with_lock(&self, product_ids: Vec<ProductId>, work: LockedWork) -> LedgerFuture<'_, ()> {
            self.locked.lock().unwrap().push(product_ids.clone());
            let mut map = self.rows.lock().unwrap();
            let mut rows = LockedRows::new(
                product_ids.iter().filter_map(|id| map.get(id).cloned()),
            );
            let result = work(&mut rows).map(|()| {
                for row in rows.into_dirty() {
                    map.insert(row.product_id.clone(), row);
                }
            });
            Box::pin(async move { result })
        }

        fn create(&self, _: ProductId, _: u32) -> LedgerFuture<'_, StockRecord> {
            Box::pin(async { Err(LedgerError::Storage("unsupported".into())) })
        }

        fn list(&self) -> LedgerFuture<'_, Vec<StockRecord>> {
            let rows = self.rows.lock().unwrap().values().cloned().collect();
            Box::pin(async move { Ok(rows) })
        }

        fn set_available(&self, _: ProductId, _: u32) -> LedgerFuture<'_, StockRecord> {
            Box::pin(async { Err(LedgerError::Storage("unsupported".into())) })
        }
    }

    #[tokio::test]
    async fn validate_passes_when_all_items_fit() {
        let ledger = MapLedger::with(&[("A", 5), ("B", 1)]);
        let engine = ReservationEngine::new(ledger);

        let availability = engine
            .validate_availability(&[ReservationItem::new("A", 5), ReservationItem::new("B", 1)])
            .await
            .unwrap();

        assert!(availability.is_available());
    }

    #[tokio::test]
    async fn validate_short_circuits_on_first_failure() {
        let ledger = MapLedger::with(&[("A", 0), ("B", 9)]);
        let engine = ReservationEngine::new(ledger.clone());

        let availability = engine
            .validate_availability(&[ReservationItem::new("A", 1), ReservationItem::new("B", 1)])
            .await
            .unwrap();

        assert_eq!(
            availability,
            Availability::Unavailable {
                product_id: ProductId::new("A"),
                reason: "Insufficient stock for product A. Available: 0, Requested: 1".into(),
            }
        );
        assert_eq!(ledger.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validate_reports_missing_products() {
        let engine = ReservationEngine::new(MapLedger::with(&[]));

        let availability = engine
            .validate_availability(&[ReservationItem::new("ghost", 1)])
            .await
            .unwrap();

        assert_eq!(
            availability.reason(),
            Some("Product ghost not found in inventory")
        );
    }

    #[tokio::test]
    async fn validate_rejects_zero_quantity() {
        let engine = ReservationEngine::new(MapLedger::with(&[("A", 3)]));

        let availability = engine
            .validate_availability(&[ReservationItem::new("A", 0)])
            .await
            .unwrap();

        assert_eq!(availability.reason(), Some("Invalid quantity 0 for product A"));
    }

    #[tokio::test]
    async fn reserve_locks_sorted_ids_and_moves_stock() {
        let ledger = MapLedger::with(&[("A", 5), ("B", 5)]);
        let engine = ReservationEngine::new(ledger.clone());

        engine
            .reserve(&[ReservationItem::new("B", 2), ReservationItem::new("A", 3)])
            .await
            .unwrap();

        assert_eq!(
            ledger.locked.lock().unwrap()[0],
            vec![ProductId::new("A"), ProductId::new("B")]
        );
        assert_eq!(ledger.row("A").available_stock, 2);
        assert_eq!(ledger.row("A").reserved_stock, 3);
        assert_eq!(ledger.row("B").available_stock, 3);
        assert_eq!(ledger.row("B").reserved_stock, 2);
    }

    #[tokio::test]
    async fn reserve_is_all_or_nothing() {
        let ledger = MapLedger::with(&[("A", 5), ("B", 0)]);
        let engine = ReservationEngine::new(ledger.clone());

        let err = engine
            .reserve(&[ReservationItem::new("A", 3), ReservationItem::new("B", 1)])
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ReservationError::InsufficientStock {
                product_id: ProductId::new("B"),
                available: 0,
                requested: 1,
            }
        );
        assert_eq!(ledger.row("A").available_stock, 5);
        assert_eq!(ledger.row("A").reserved_stock, 0);
    }

    #[tokio::test]
    async fn reserve_applies_duplicate_lines_cumulatively() {
        let ledger = MapLedger::with(&[("A", 3)]);
        let engine = ReservationEngine::new(ledger.clone());

        let err = engine
            .reserve(&[ReservationItem::new("A", 2), ReservationItem::new("A", 2)])
            .await
            .unwrap_err();

        assert!(matches!(err, ReservationError::InsufficientStock { available: 1, .. }));
        assert_eq!(ledger.row("A").available_stock, 3);
    }

    #[test]
    fn ledger_faults_are_not_business_rejections() {
        let err = ReservationError::from(LedgerError::LockTimeout("5s".into()));
        assert!(!err.is_business_rejection());
        assert_eq!(err.to_string(), "Lock timeout: 5s");

        let err = ReservationError::from(LedgerError::NotFound(ProductId::new("x")));
        assert!(err.is_business_rejection());
    }
}
