//! # Stockbridge Core
//!
//! Domain types, ports and the reservation engine shared by the inventory and
//! order sides of the stock reservation flow.
//!
//! ## Core Concepts
//!
//! - **Ledger**: transactional per-product stock counters with row-level locking
//! - **Reservation Engine**: validates and commits a reservation against the ledger
//! - **Broker**: the minimal message-broker port (topology, consume, publish, ack/nack)
//! - **Envelopes**: the JSON wire contract exchanged between the two services
//!
//! ## Data Flow
//!
//! ```text
//! OrderCreated ──► consumer ──► engine.validate_availability
//!                                   │
//!                                   ▼
//!                              engine.reserve ──► Ledger::with_lock
//!                                   │
//!                                   ▼
//!                    StockReserved / StockRejected ──► response exchange
//! ```
//!
//! Everything with I/O sits behind a trait object (`Arc<dyn Ledger>`,
//! `Arc<dyn Broker>`) so production adapters and in-memory fakes are
//! interchangeable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod broker;
pub mod engine;
pub mod envelope;
pub mod ledger;
pub mod legacy;
pub mod order;
pub mod reservation;
pub mod stock;
pub mod topology;

pub use engine::{Availability, ReservationEngine, ReservationError};
pub use ledger::{Ledger, LedgerError, LockedRows, LockedWork};
pub use reservation::{ReservationItem, ReservationOutcome, ReservationRequest};
pub use stock::{ProductId, StockRecord};

/// Environment traits injected into the engine and the runtime.
///
/// All sources of non-determinism are abstracted here so tests can pin them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
