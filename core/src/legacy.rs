//! Translation shim for the legacy wire variant.
//!
//! Older producers emit PascalCase discriminators (`OrderCreated`,
//! `StockReserved`, `StockRejected`), carry reserved lines in `reservedItems`,
//! and stamp ISO-8601 strings in `createdAt` / `reservedAt` / `rejectedAt`.
//! These structs decode that shape verbatim and convert into the canonical
//! envelopes. Nothing is ever emitted in this shape.

use crate::envelope::{
    EnvelopeError, EventType, OrderCreated, OrderLine, StockRejected, StockReserved,
};
use crate::reservation::ReservationItem;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Legacy `OrderCreated` envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyOrderCreated {
    /// Order identifier
    pub order_id: String,
    /// Customer who placed the order
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Ordered lines
    pub items: Vec<OrderLine>,
    /// Correlation id
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Opaque shipping address blob
    #[serde(default)]
    pub shipping_address_json: Option<String>,
    /// ISO-8601 creation time
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Legacy `StockReserved` envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyStockReserved {
    /// Order identifier
    pub order_id: String,
    /// Correlation id, absent on the oldest producers
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Reserved lines
    pub reserved_items: Vec<ReservationItem>,
    /// ISO-8601 decision time
    pub reserved_at: String,
}

/// Legacy `StockRejected` envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyStockRejected {
    /// Order identifier
    pub order_id: String,
    /// Correlation id, absent on the oldest producers
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Why nothing was reserved
    pub reason: String,
    /// ISO-8601 decision time
    pub rejected_at: String,
}

fn epoch_millis(iso: &str) -> Result<i64, EnvelopeError> {
    DateTime::parse_from_rfc3339(iso)
        .map(|at| at.with_timezone(&Utc).timestamp_millis())
        .map_err(|_| EnvelopeError::InvalidTimestamp(iso.to_string()))
}

fn correlation_or_order(correlation_id: Option<String>, order_id: &str) -> String {
    correlation_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| order_id.to_string())
}

impl TryFrom<LegacyOrderCreated> for OrderCreated {
    type Error = EnvelopeError;

    fn try_from(legacy: LegacyOrderCreated) -> Result<Self, Self::Error> {
        let timestamp = legacy.created_at.as_deref().map(epoch_millis).transpose()?;
        Ok(Self {
            event_type: EventType::OrderCreated,
            order_id: legacy.order_id,
            customer_id: legacy.customer_id,
            items: legacy.items,
            correlation_id: legacy.correlation_id,
            shipping_address_json: legacy.shipping_address_json,
            timestamp,
        })
    }
}

impl TryFrom<LegacyStockReserved> for StockReserved {
    type Error = EnvelopeError;

    fn try_from(legacy: LegacyStockReserved) -> Result<Self, Self::Error> {
        let timestamp = epoch_millis(&legacy.reserved_at)?;
        Ok(Self {
            event_type: EventType::StockReserved,
            correlation_id: correlation_or_order(legacy.correlation_id, &legacy.order_id),
            order_id: legacy.order_id,
            items: legacy.reserved_items,
            timestamp,
        })
    }
}

impl TryFrom<LegacyStockRejected> for StockRejected {
    type Error = EnvelopeError;

    fn try_from(legacy: LegacyStockRejected) -> Result<Self, Self::Error> {
        let timestamp = epoch_millis(&legacy.rejected_at)?;
        Ok(Self {
            event_type: EventType::StockRejected,
            correlation_id: correlation_or_order(legacy.correlation_id, &legacy.order_id),
            order_id: legacy.order_id,
            reason: legacy.reason,
            timestamp,
        })
    }
}
