//! Per-product stock counters.
//!
//! A [`StockRecord`] exists once per product. Its two counters are unsigned,
//! so the "never negative" invariant holds by construction; every mutation goes
//! through checked arithmetic and reports a [`LedgerError`] instead of wrapping.

use crate::ledger::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable product identifier, the unique key of the ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Create a product identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProductId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ProductId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Stock counters for a single product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    /// Product this record belongs to
    pub product_id: ProductId,
    /// Units that can still be reserved
    pub available_stock: u32,
    /// Units held for orders that have not shipped yet
    pub reserved_stock: u32,
    /// Time of the last committed write
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// Create a fresh record with nothing reserved.
    #[must_use]
    pub fn new(product_id: ProductId, available_stock: u32, updated_at: DateTime<Utc>) -> Self {
        Self {
            product_id,
            available_stock,
            reserved_stock: 0,
            updated_at,
        }
    }

    /// Whether `quantity` units could be reserved right now.
    #[must_use]
    pub const fn can_reserve(&self, quantity: u32) -> bool {
        self.available_stock >= quantity
    }

    /// Move `quantity` units from available to reserved.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidQuantity`] when `quantity` is zero
    /// - [`LedgerError::InsufficientStock`] when fewer than `quantity` units are
    ///   available, or when the reserved counter would overflow
    ///
    /// The record is untouched on error.
    pub fn reserve(&mut self, quantity: u32) -> Result<(), LedgerError> {
        if quantity == 0 {
            return Err(LedgerError::InvalidQuantity {
                product_id: self.product_id.clone(),
            });
        }

        let insufficient = || LedgerError::InsufficientStock {
            product_id: self.product_id.clone(),
            available: self.available_stock,
            requested: quantity,
        };

        let available = self.available_stock.checked_sub(quantity).ok_or_else(insufficient)?;
        let reserved = self.reserved_stock.checked_add(quantity).ok_or_else(insufficient)?;

        self.available_stock = available;
        self.reserved_stock = reserved;
        Ok(())
    }

    /// Total units tracked by this record.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.available_stock as u64 + self.reserved_stock as u64
    }
}
