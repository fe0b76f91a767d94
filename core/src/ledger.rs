//! Stock ledger port.
//!
//! The [`Ledger`] is the only cross-instance shared mutable state in the system.
//! All reservation writes go through [`Ledger::with_lock`], which runs a
//! closure against exclusively locked rows inside one atomic transaction.
//!
//! # Locking Contract
//!
//! - Row ids are sorted and de-duplicated before any lock is taken, so two
//!   concurrent multi-item reservations can never wait on each other in a cycle.
//! - The closure works on an in-memory copy of the locked rows ([`LockedRows`]).
//!   Only when it returns `Ok` are the touched rows written back and committed.
//! - A closure error, or a failure while writing any row back, rolls back the
//!   whole batch. No row is ever left partially mutated.
//!
//! # Implementations
//!
//! - `InMemoryLedger` (stockbridge-testing) - per-row async mutexes
//! - `PostgresLedger` (stockbridge-postgres) - `SELECT ... FOR UPDATE`

use crate::stock::{ProductId, StockRecord};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// No stock record exists for the product
    #[error("Product {0} not found in inventory")]
    NotFound(ProductId),

    /// A stock record already exists for the product
    #[error("Stock record for product {0} already exists")]
    AlreadyExists(ProductId),

    /// The product does not have enough available stock
    #[error("Insufficient stock for product {product_id}. Available: {available}, Requested: {requested}")]
    InsufficientStock {
        /// Product that ran short
        product_id: ProductId,
        /// Units available when the check ran
        available: u32,
        /// Units requested
        requested: u32,
    },

    /// The requested quantity is not a positive number
    #[error("Invalid quantity 0 for product {product_id}")]
    InvalidQuantity {
        /// Product the quantity was requested for
        product_id: ProductId,
    },

    /// Row locks could not be acquired in time
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// The underlying store failed
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Rows locked for the duration of a [`Ledger::with_lock`] call.
///
/// Reads are free. Any row obtained through [`LockedRows::get_mut`] is marked
/// dirty and will be written back on commit.
#[derive(Debug, Default)]
pub struct LockedRows {
    rows: BTreeMap<ProductId, StockRecord>,
    dirty: BTreeSet<ProductId>,
}

impl LockedRows {
    /// Build the working set from the rows the ledger managed to lock.
    #[must_use]
    pub fn new(rows: impl IntoIterator<Item = StockRecord>) -> Self {
        Self {
            rows: rows
                .into_iter()
                .map(|row| (row.product_id.clone(), row))
                .collect(),
            dirty: BTreeSet::new(),
        }
    }

    /// Read a locked row.
    #[must_use]
    pub fn get(&self, product_id: &ProductId) -> Option<&StockRecord> {
        self.rows.get(product_id)
    }

    /// Borrow a locked row for mutation.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the row does not exist.
    pub fn get_mut(&mut self, product_id: &ProductId) -> Result<&mut StockRecord, LedgerError> {
        let row = self
            .rows
            .get_mut(product_id)
            .ok_or_else(|| LedgerError::NotFound(product_id.clone()))?;
        self.dirty.insert(product_id.clone());
        Ok(row)
    }

    /// Number of rows in the working set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no row was found for any requested id.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Consume the working set, yielding touched rows in product id order.
    #[must_use]
    pub fn into_dirty(mut self) -> Vec<StockRecord> {
        self.dirty
            .iter()
            .filter_map(|id| self.rows.remove(id))
            .collect()
    }
}

/// Work executed while the rows are locked.
pub type LockedWork = Box<dyn FnOnce(&mut LockedRows) -> Result<(), LedgerError> + Send>;

/// Boxed future returned by ledger operations.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Transactional store of per-product stock counters.
///
/// Methods return boxed futures so the trait stays dyn-compatible
/// (`Arc<dyn Ledger>`).
pub trait Ledger: Send + Sync {
    /// Read the current record for a product, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the store cannot be read.
    fn get<'a>(&'a self, product_id: &'a ProductId) -> LedgerFuture<'a, Option<StockRecord>>;

    /// Run `work` against exclusively locked rows inside one transaction.
    ///
    /// Ids that have no row are simply absent from the [`LockedRows`] handed to
    /// `work`. The implementation sorts and de-duplicates `product_ids` before
    /// acquiring locks.
    ///
    /// # Errors
    ///
    /// Returns the error produced by `work` (after rolling back), or
    /// [`LedgerError::LockTimeout`] / [`LedgerError::Storage`] on store failures.
    fn with_lock(&self, product_ids: Vec<ProductId>, work: LockedWork) -> LedgerFuture<'_, ()>;

    /// Register a new product with `available_stock` units and nothing reserved.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::AlreadyExists`] if the product is already registered.
    fn create(&self, product_id: ProductId, available_stock: u32) -> LedgerFuture<'_, StockRecord>;

    /// All records ordered by product id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Storage`] if the store cannot be read.
    fn list(&self) -> LedgerFuture<'_, Vec<StockRecord>>;

    /// Overwrite the available counter of an existing product.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the product is not registered.
    fn set_available(
        &self,
        product_id: ProductId,
        available_stock: u32,
    ) -> LedgerFuture<'_, StockRecord>;
}

/// Sort and de-duplicate ids into lock acquisition order.
#[must_use]
pub fn lock_order(product_ids: Vec<ProductId>) -> Vec<ProductId> {
    let mut ids = product_ids;
    ids.sort();
    ids.dedup();
    ids
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn row(id: &str, available: u32) -> StockRecord {
        StockRecord::new(ProductId::new(id), available, Utc::now())
    }

    #[test]
    fn lock_order_sorts_and_dedups() {
        let ids = vec![
            ProductId::new("b"),
            ProductId::new("a"),
            ProductId::new("b"),
            ProductId::new("c"),
        ];
        assert_eq!(
            lock_order(ids),
            vec![ProductId::new("a"), ProductId::new("b"), ProductId::new("c")]
        );
    }

    #[test]
    fn only_touched_rows_are_dirty() {
        let mut rows = LockedRows::new(vec![row("a", 1), row("b", 2)]);
        rows.get_mut(&ProductId::new("b")).unwrap().reserve(1).unwrap();
        assert!(rows.get(&ProductId::new("a")).is_some());

        let dirty = rows.into_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].product_id, ProductId::new("b"));
        assert_eq!(dirty[0].available_stock, 1);
    }

    #[test]
    fn get_mut_reports_missing_rows() {
        let mut rows = LockedRows::new(vec![row("a", 1)]);
        assert_eq!(
            rows.get_mut(&ProductId::new("zz")).unwrap_err(),
            LedgerError::NotFound(ProductId::new("zz"))
        );
    }
}
