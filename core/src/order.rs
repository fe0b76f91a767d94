//! Order-side view of a reservation.
//!
//! The order service keeps a status per order and moves it out of `PENDING`
//! exactly once, when the inventory outcome arrives.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Cancellation reason recorded when stock could not be reserved.
pub const STOCK_UNAVAILABLE_REASON: &str = "Stock not available for requested items";

/// Lifecycle of an order with respect to stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Waiting for the inventory decision
    Pending,
    /// Stock reserved
    Confirmed,
    /// Stock rejected
    Cancelled,
}

impl OrderStatus {
    /// Storage and log representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(Self::Pending),
            "CONFIRMED" => Some(Self::Confirmed),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored status of one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    /// Order identifier
    pub order_id: String,
    /// Current status
    pub status: OrderStatus,
    /// Set when the order was cancelled
    pub cancellation_reason: Option<String>,
    /// Time of the last status change
    pub updated_at: DateTime<Utc>,
}

/// Errors from the order status store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrderStoreError {
    /// No order with this id
    #[error("Order {0} not found")]
    NotFound(String),

    /// An order with this id already exists
    #[error("Order {0} already exists")]
    AlreadyExists(String),

    /// The order is not in a state that allows the transition
    #[error("Order {order_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Order identifier
        order_id: String,
        /// Current status
        from: OrderStatus,
        /// Requested status
        to: OrderStatus,
    },

    /// The underlying store failed
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Boxed future returned by order store operations.
pub type OrderStoreFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, OrderStoreError>> + Send + 'a>>;

/// Persistence of order statuses.
pub trait OrderStatusStore: Send + Sync {
    /// Record a new order as `PENDING`.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::AlreadyExists`] for a duplicate id.
    fn insert_pending<'a>(&'a self, order_id: &'a str) -> OrderStoreFuture<'a, OrderRecord>;

    /// Current status of an order.
    ///
    /// # Errors
    ///
    /// Returns [`OrderStoreError::Storage`] if the store cannot be read.
    fn get<'a>(&'a self, order_id: &'a str) -> OrderStoreFuture<'a, Option<OrderRecord>>;

    /// Move a `PENDING` order to `to`.
    ///
    /// # Errors
    ///
    /// - [`OrderStoreError::NotFound`] for an unknown order
    /// - [`OrderStoreError::InvalidTransition`] if the order is no longer pending
    fn transition<'a>(
        &'a self,
        order_id: &'a str,
        to: OrderStatus,
        reason: Option<String>,
    ) -> OrderStoreFuture<'a, OrderRecord>;
}
