//! Reservation requests and their outcomes.
//!
//! Both types are ephemeral: a request lives for one message-processing cycle
//! and an outcome is handed straight to the publisher.

use crate::stock::ProductId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One line of a reservation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationItem {
    /// Product to reserve
    pub product_id: ProductId,
    /// Units to reserve
    pub quantity: u32,
}

impl ReservationItem {
    /// Create a reservation line.
    #[must_use]
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// A request to reserve stock for one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    /// Order the reservation belongs to
    pub order_id: String,
    /// Correlation id echoed on the outcome
    pub correlation_id: String,
    /// Lines in request order
    pub items: Vec<ReservationItem>,
}

impl ReservationRequest {
    /// Build a request, defaulting the correlation id to the order id.
    #[must_use]
    pub fn new(
        order_id: impl Into<String>,
        correlation_id: Option<String>,
        items: Vec<ReservationItem>,
    ) -> Self {
        let order_id = order_id.into();
        let correlation_id = correlation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| order_id.clone());
        Self {
            order_id,
            correlation_id,
            items,
        }
    }

    /// Turn the request into a `Reserved` outcome.
    #[must_use]
    pub fn reserved(self, timestamp: DateTime<Utc>) -> ReservationOutcome {
        ReservationOutcome::Reserved {
            order_id: self.order_id,
            correlation_id: self.correlation_id,
            items: self.items,
            timestamp,
        }
    }

    /// Turn the request into a `Rejected` outcome.
    #[must_use]
    pub fn rejected(self, reason: impl Into<String>, timestamp: DateTime<Utc>) -> ReservationOutcome {
        ReservationOutcome::Rejected {
            order_id: self.order_id,
            correlation_id: self.correlation_id,
            reason: reason.into(),
            timestamp,
        }
    }
}

/// Terminal decision for one reservation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// All items were reserved
    Reserved {
        /// Order the reservation belongs to
        order_id: String,
        /// Correlation id of the inbound request
        correlation_id: String,
        /// The reserved items, as requested
        items: Vec<ReservationItem>,
        /// Decision time
        timestamp: DateTime<Utc>,
    },
    /// Nothing was reserved
    Rejected {
        /// Order the reservation belongs to
        order_id: String,
        /// Correlation id of the inbound request
        correlation_id: String,
        /// Human-readable cause
        reason: String,
        /// Decision time
        timestamp: DateTime<Utc>,
    },
}

impl ReservationOutcome {
    /// Order id the outcome refers to.
    #[must_use]
    pub fn order_id(&self) -> &str {
        match self {
            Self::Reserved { order_id, .. } | Self::Rejected { order_id, .. } => order_id,
        }
    }

    /// Correlation id the outcome refers to.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Reserved { correlation_id, .. } | Self::Rejected { correlation_id, .. } => {
                correlation_id
            }
        }
    }

    /// Whether stock was reserved.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }

    /// Rejection reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Reserved { .. } => None,
            Self::Rejected { reason, .. } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_defaults_to_order_id() {
        let request = ReservationRequest::new("order-1", None, vec![]);
        assert_eq!(request.correlation_id, "order-1");

        let request = ReservationRequest::new("order-1", Some(String::new()), vec![]);
        assert_eq!(request.correlation_id, "order-1");

        let request = ReservationRequest::new("order-1", Some("corr-9".into()), vec![]);
        assert_eq!(request.correlation_id, "corr-9");
    }

    #[test]
    fn outcomes_keep_identity() {
        let now = Utc::now();
        let request = ReservationRequest::new(
            "order-1",
            Some("corr-1".into()),
            vec![ReservationItem::new("P", 2)],
        );

        let rejected = request.clone().rejected("nope", now);
        assert_eq!(rejected.order_id(), "order-1");
        assert_eq!(rejected.correlation_id(), "corr-1");
        assert_eq!(rejected.reason(), Some("nope"));
        assert!(!rejected.is_reserved());

        let reserved = request.reserved(now);
        assert!(reserved.is_reserved());
        assert_eq!(reserved.reason(), None);
    }
}
