//! # Stockbridge Testing
//!
//! In-memory fakes and helpers for exercising the reservation flow without a
//! database or a broker.
//!
//! This crate provides:
//! - [`InMemoryLedger`]: row-locked stock ledger with fault injection
//! - [`InMemoryBroker`]: topic-routing broker with prefetch and ack/nack tracking
//! - [`InMemoryOrderStatusStore`]: order statuses for the order side
//! - [`FixedClock`]: deterministic time
//! - payload builders and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use stockbridge_testing::{InMemoryBroker, InMemoryLedger, helpers};
//!
//! #[tokio::test]
//! async fn reserves_stock() {
//!     let ledger = InMemoryLedger::seeded(&[("P", 10)]);
//!     let broker = InMemoryBroker::with_topology(&topology);
//!     broker.inject("order.exchange", "order.created", helpers::order_created("o-1", &[("P", 10)]))?;
//!     // run the consumer...
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use stockbridge_core::environment::Clock;

pub mod broker;
pub mod ledger;
pub mod orders;

/// Mock implementations of environment traits.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use stockbridge_testing::mocks::FixedClock;
    /// use stockbridge_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }
}

/// Payload builders and tracing setup.
pub mod helpers {
    /// Canonical `ORDER_CREATED` payload for `(product, quantity)` lines.
    #[must_use]
    pub fn order_created(order_id: &str, items: &[(&str, u32)]) -> Vec<u8> {
        let lines: Vec<String> = items
            .iter()
            .map(|(product, quantity)| {
                format!(r#"{{"productId":"{product}","quantity":{quantity},"unitPrice":1.5}}"#)
            })
            .collect();
        format!(
            r#"{{"eventType":"ORDER_CREATED","orderId":"{order_id}","customerId":"customer-1","items":[{}],"timestamp":1735689600000}}"#,
            lines.join(",")
        )
        .into_bytes()
    }

    /// Install a test-friendly tracing subscriber once per process.
    ///
    /// Honours `RUST_LOG`; output is captured by the test harness.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;
    use stockbridge_core::ReservationItem;

    /// Product ids used by the strategies.
    pub const PRODUCTS: [&str; 4] = ["P0", "P1", "P2", "P3"];

    /// One reservation line over [`PRODUCTS`] with a positive quantity.
    pub fn reservation_item() -> impl Strategy<Value = ReservationItem> {
        (0..PRODUCTS.len(), 1u32..8)
            .prop_map(|(index, quantity)| ReservationItem::new(PRODUCTS[index], quantity))
    }

    /// A non-empty request of up to four lines.
    pub fn reservation_items() -> impl Strategy<Value = Vec<ReservationItem>> {
        proptest::collection::vec(reservation_item(), 1..=4)
    }
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, InMemoryConnection};
pub use ledger::InMemoryLedger;
pub use mocks::{FixedClock, test_clock};
pub use orders::InMemoryOrderStatusStore;
