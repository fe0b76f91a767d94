//! In-memory stock ledger.
//!
//! Each row sits behind its own async mutex, so two reservations touching
//! disjoint products proceed in parallel while overlapping ones serialize on
//! the shared rows, exactly like row-level locks in a database. Locks are taken
//! in sorted product id order.
//!
//! Writes are staged: the closure works on copies, and rows are only replaced
//! once every staged write has been accepted. Fault injection hooks let tests
//! break a write halfway through a batch and observe the rollback.
//!
//! # Example
//!
//! ```
//! use stockbridge_testing::InMemoryLedger;
//! use stockbridge_core::{Ledger, ProductId};
//!
//! # tokio_test::block_on(async {
//! let ledger = InMemoryLedger::seeded(&[("P", 10)]);
//! let record = ledger.get(&ProductId::new("P")).await.unwrap().unwrap();
//! assert_eq!(record.available_stock, 10);
//! # });
//! ```

use crate::mocks::test_clock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stockbridge_core::environment::Clock;
use stockbridge_core::ledger::{LedgerFuture, lock_order};
use stockbridge_core::{Ledger, LedgerError, LockedRows, LockedWork, ProductId, StockRecord};

type Row = Arc<tokio::sync::Mutex<StockRecord>>;

#[derive(Debug, Default)]
struct Faults {
    /// Writing this row back fails with a storage error
    write_failure: Option<ProductId>,
    /// The next `with_lock` call fails before taking any lock
    next_lock_error: Option<LedgerError>,
    /// Every `get` fails
    reads_fail: bool,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ledger held entirely in memory.
pub struct InMemoryLedger {
    rows: Mutex<BTreeMap<ProductId, Row>>,
    faults: Mutex<Faults>,
    lock_log: Mutex<Vec<Vec<ProductId>>>,
    with_lock_calls: AtomicUsize,
    hold_locks_for: Mutex<Option<Duration>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    /// Create an empty ledger stamping writes with the fixed test clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(test_clock()))
    }

    /// Create an empty ledger with a custom clock.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            lock_log: Mutex::new(Vec::new()),
            with_lock_calls: AtomicUsize::new(0),
            hold_locks_for: Mutex::new(None),
            clock,
        }
    }

    /// Create a ledger pre-populated with `(product, available)` rows.
    #[must_use]
    pub fn seeded(rows: &[(&str, u32)]) -> Self {
        let ledger = Self::new();
        for (id, available) in rows {
            ledger.insert(StockRecord::new(
                ProductId::new(*id),
                *available,
                ledger.clock.now(),
            ));
        }
        ledger
    }

    /// Insert or replace a row without going through the admin API.
    pub fn insert(&self, record: StockRecord) {
        guard(&self.rows).insert(
            record.product_id.clone(),
            Arc::new(tokio::sync::Mutex::new(record)),
        );
    }

    /// Make the write-back of `product_id` fail, rolling back its batch.
    pub fn fail_writes_for(&self, product_id: impl Into<ProductId>) {
        guard(&self.faults).write_failure = Some(product_id.into());
    }

    /// Make the next `with_lock` fail with `error` before locking anything.
    pub fn fail_next_lock(&self, error: LedgerError) {
        guard(&self.faults).next_lock_error = Some(error);
    }

    /// Make every `get` fail with a storage error.
    pub fn fail_reads(&self, fail: bool) {
        guard(&self.faults).reads_fail = fail;
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        *guard(&self.faults) = Faults::default();
    }

    /// Keep row locks for `duration` before running the closure.
    ///
    /// Widens the window in which concurrent reservations contend.
    pub fn hold_locks_for(&self, duration: Duration) {
        *guard(&self.hold_locks_for) = Some(duration);
    }

    /// Number of `with_lock` calls so far.
    #[must_use]
    pub fn with_lock_calls(&self) -> usize {
        self.with_lock_calls.load(Ordering::SeqCst)
    }

    /// Lock acquisition order of every `with_lock` call so far.
    #[must_use]
    pub fn lock_log(&self) -> Vec<Vec<ProductId>> {
        guard(&self.lock_log).clone()
    }

    /// Current snapshot of a row, waiting for any writer holding it.
    pub async fn snapshot(&self, product_id: &str) -> Option<StockRecord> {
        let row = guard(&self.rows).get(&ProductId::new(product_id)).cloned()?;
        let record = row.lock().await.clone();
        Some(record)
    }

    fn row(&self, product_id: &ProductId) -> Option<Row> {
        guard(&self.rows).get(product_id).cloned()
    }

    async fn run_locked(
        &self,
        product_ids: Vec<ProductId>,
        work: LockedWork,
    ) -> Result<(), LedgerError> {
        self.with_lock_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = guard(&self.faults).next_lock_error.take() {
            return Err(error);
        }

        let ids = lock_order(product_ids);
        guard(&self.lock_log).push(ids.clone());

        let cells: Vec<Row> = ids.iter().filter_map(|id| self.row(id)).collect();
        let mut held = Vec::with_capacity(cells.len());
        for cell in cells {
            held.push(cell.lock_owned().await);
        }

        let hold = *guard(&self.hold_locks_for);
        if let Some(hold) = hold {
            tokio::time::sleep(hold).await;
        }

        let mut rows = LockedRows::new(held.iter().map(|row| (**row).clone()));
        work(&mut rows)?;

        let mut staged = rows.into_dirty();
        let failing = guard(&self.faults).write_failure.clone();
        let now = self.clock.now();
        for row in &mut staged {
            if failing.as_ref() == Some(&row.product_id) {
                tracing::debug!(product_id = %row.product_id, "Injected write failure, rolling back");
                return Err(LedgerError::Storage(format!(
                    "write failed for product {}",
                    row.product_id
                )));
            }
            row.updated_at = now;
        }

        for row in staged {
            if let Some(slot) = held.iter_mut().find(|held| held.product_id == row.product_id) {
                **slot = row;
            }
        }
        Ok(())
    }
}

impl Ledger for InMemoryLedger {
    fn get<'a>(&'a self, product_id: &'a ProductId) -> LedgerFuture<'a, Option<StockRecord>> {
        Box::pin(async move {
            if guard(&self.faults).reads_fail {
                return Err(LedgerError::Storage("read failed".to_string()));
            }
            match self.row(product_id) {
                Some(row) => Ok(Some(row.lock().await.clone())),
                None => Ok(None),
            }
        })
    }

    fn with_lock(&self, product_ids: Vec<ProductId>, work: LockedWork) -> LedgerFuture<'_, ()> {
        Box::pin(self.run_locked(product_ids, work))
    }

    fn create(&self, product_id: ProductId, available_stock: u32) -> LedgerFuture<'_, StockRecord> {
        Box::pin(async move {
            let mut rows = guard(&self.rows);
            if rows.contains_key(&product_id) {
                return Err(LedgerError::AlreadyExists(product_id));
            }
            let record = StockRecord::new(product_id.clone(), available_stock, self.clock.now());
            rows.insert(product_id, Arc::new(tokio::sync::Mutex::new(record.clone())));
            Ok(record)
        })
    }

    fn list(&self) -> LedgerFuture<'_, Vec<StockRecord>> {
        Box::pin(async move {
            let cells: Vec<Row> = guard(&self.rows).values().cloned().collect();
            let mut records = Vec::with_capacity(cells.len());
            for cell in cells {
                records.push(cell.lock().await.clone());
            }
            Ok(records)
        })
    }

    fn set_available(
        &self,
        product_id: ProductId,
        available_stock: u32,
    ) -> LedgerFuture<'_, StockRecord> {
        Box::pin(async move {
            let row = self
                .row(&product_id)
                .ok_or_else(|| LedgerError::NotFound(product_id.clone()))?;
            let mut record = row.lock().await;
            record.available_stock = available_stock;
            record.updated_at = self.clock.now();
            Ok(record.clone())
        })
    }
}
