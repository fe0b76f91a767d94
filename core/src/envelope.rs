//! JSON wire contract between the order and inventory services.
//!
//! The canonical schema uses a SCREAMING_SNAKE_CASE `eventType`, camelCase
//! fields, an `items` array and an epoch-millisecond `timestamp`. The older
//! PascalCase variant is decoded by the structs in [`crate::legacy`] and
//! converted into the canonical types; field names are never aliased here.
//!
//! ```text
//! ORDER_CREATED   { eventType, orderId, customerId, items[], correlationId?, shippingAddressJson?, timestamp? }
//! STOCK_RESERVED  { eventType, orderId, correlationId, items[], timestamp }
//! STOCK_REJECTED  { eventType, orderId, correlationId, reason, timestamp }
//! ```

use crate::legacy::{LegacyOrderCreated, LegacyStockRejected, LegacyStockReserved};
use crate::reservation::{ReservationItem, ReservationOutcome, ReservationRequest};
use crate::stock::ProductId;
use crate::topology::{ORDER_CREATED_KEY, STOCK_REJECTED_KEY, STOCK_RESERVED_KEY};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// MIME type of every published envelope.
pub const CONTENT_TYPE: &str = "application/json";

/// Errors raised while decoding or encoding envelopes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The payload is not valid JSON
    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    /// The payload is JSON but not an object
    #[error("Payload is not a JSON object")]
    NotAnObject,

    /// The payload does not match the expected envelope shape
    #[error("Envelope does not match {event_type}: {reason}")]
    Shape {
        /// Envelope the payload was decoded as
        event_type: &'static str,
        /// Decoder message
        reason: String,
    },

    /// A required identifying field is missing or empty
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A legacy timestamp is not ISO-8601
    #[error("Invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// Encoding an outbound envelope failed
    #[error("Failed to encode envelope: {0}")]
    Encode(String),
}

/// Event discriminator carried in `eventType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// An order was placed and needs stock
    OrderCreated,
    /// Stock was reserved for an order
    StockReserved,
    /// Stock could not be reserved for an order
    StockRejected,
}

impl EventType {
    /// Canonical wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OrderCreated => "ORDER_CREATED",
            Self::StockReserved => "STOCK_RESERVED",
            Self::StockRejected => "STOCK_REJECTED",
        }
    }

    /// Routing key this event is published under.
    #[must_use]
    pub const fn routing_key(self) -> &'static str {
        match self {
            Self::OrderCreated => ORDER_CREATED_KEY,
            Self::StockReserved => STOCK_RESERVED_KEY,
            Self::StockRejected => STOCK_REJECTED_KEY,
        }
    }

    /// Event implied by a routing key, if the key is one of ours.
    #[must_use]
    pub fn from_routing_key(routing_key: &str) -> Option<Self> {
        match routing_key {
            ORDER_CREATED_KEY => Some(Self::OrderCreated),
            STOCK_RESERVED_KEY => Some(Self::StockReserved),
            STOCK_REJECTED_KEY => Some(Self::StockRejected),
            _ => None,
        }
    }

    const fn order_created() -> Self {
        Self::OrderCreated
    }

    const fn stock_reserved() -> Self {
        Self::StockReserved
    }

    const fn stock_rejected() -> Self {
        Self::StockRejected
    }
}

/// Which contract version an envelope follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schema {
    /// `items` / epoch-millis `timestamp`
    Canonical,
    /// `reservedItems` / ISO-8601 `*At` fields
    Legacy,
}

/// What the `eventType` field says about a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discriminator {
    /// A recognised event in either contract version
    Known(EventType, Schema),
    /// A string we do not recognise
    Unknown(String),
    /// No `eventType` string at all
    Missing,
}

impl Discriminator {
    /// Classify a raw `eventType` value.
    #[must_use]
    pub fn of(event_type: Option<&str>) -> Self {
        let Some(raw) = event_type else {
            return Self::Missing;
        };
        match raw {
            "ORDER_CREATED" => Self::Known(EventType::OrderCreated, Schema::Canonical),
            "STOCK_RESERVED" => Self::Known(EventType::StockReserved, Schema::Canonical),
            "STOCK_REJECTED" => Self::Known(EventType::StockRejected, Schema::Canonical),
            "OrderCreated" => Self::Known(EventType::OrderCreated, Schema::Legacy),
            "StockReserved" => Self::Known(EventType::StockReserved, Schema::Legacy),
            "StockRejected" => Self::Known(EventType::StockRejected, Schema::Legacy),
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// One line of an `ORDER_CREATED` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    /// Product ordered
    pub product_id: ProductId,
    /// Units ordered
    pub quantity: u32,
    /// Price per unit, informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
}

/// `ORDER_CREATED` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    /// Always [`EventType::OrderCreated`]
    #[serde(default = "EventType::order_created")]
    pub event_type: EventType,
    /// Order identifier
    pub order_id: String,
    /// Customer who placed the order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    /// Ordered lines
    pub items: Vec<OrderLine>,
    /// Correlation id, defaults to the order id downstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Opaque shipping address blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address_json: Option<String>,
    /// Emission time in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl OrderCreated {
    /// Reservation request described by this order.
    #[must_use]
    pub fn to_request(&self) -> ReservationRequest {
        ReservationRequest::new(
            self.order_id.clone(),
            self.correlation_id.clone(),
            self.items
                .iter()
                .map(|line| ReservationItem::new(line.product_id.clone(), line.quantity))
                .collect(),
        )
    }
}

/// `STOCK_RESERVED` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReserved {
    /// Always [`EventType::StockReserved`]
    #[serde(default = "EventType::stock_reserved")]
    pub event_type: EventType,
    /// Order identifier
    pub order_id: String,
    /// Correlation id of the originating order event
    pub correlation_id: String,
    /// Reserved lines
    pub items: Vec<ReservationItem>,
    /// Decision time in epoch milliseconds
    pub timestamp: i64,
}

/// `STOCK_REJECTED` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockRejected {
    /// Always [`EventType::StockRejected`]
    #[serde(default = "EventType::stock_rejected")]
    pub event_type: EventType,
    /// Order identifier
    pub order_id: String,
    /// Correlation id of the originating order event
    pub correlation_id: String,
    /// Why nothing was reserved
    pub reason: String,
    /// Decision time in epoch milliseconds
    pub timestamp: i64,
}

/// Outbound envelope for a reservation outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutcomeEnvelope {
    /// `STOCK_RESERVED`
    Reserved(StockReserved),
    /// `STOCK_REJECTED`
    Rejected(StockRejected),
}

impl OutcomeEnvelope {
    /// Canonical envelope for an outcome.
    #[must_use]
    pub fn from_outcome(outcome: &ReservationOutcome) -> Self {
        match outcome {
            ReservationOutcome::Reserved {
                order_id,
                correlation_id,
                items,
                timestamp,
            } => Self::Reserved(StockReserved {
                event_type: EventType::StockReserved,
                order_id: order_id.clone(),
                correlation_id: correlation_id.clone(),
                items: items.clone(),
                timestamp: timestamp.timestamp_millis(),
            }),
            ReservationOutcome::Rejected {
                order_id,
                correlation_id,
                reason,
                timestamp,
            } => Self::Rejected(StockRejected {
                event_type: EventType::StockRejected,
                order_id: order_id.clone(),
                correlation_id: correlation_id.clone(),
                reason: reason.clone(),
                timestamp: timestamp.timestamp_millis(),
            }),
        }
    }

    /// Discriminator of this envelope.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Reserved(_) => EventType::StockReserved,
            Self::Rejected(_) => EventType::StockRejected,
        }
    }

    /// Order id the envelope refers to.
    #[must_use]
    pub fn order_id(&self) -> &str {
        match self {
            Self::Reserved(e) => &e.order_id,
            Self::Rejected(e) => &e.order_id,
        }
    }

    /// Routing key on the response exchange.
    #[must_use]
    pub const fn routing_key(&self) -> &'static str {
        self.event_type().routing_key()
    }

    /// Serialize to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Encode`] if serialization fails.
    pub fn to_json(&self) -> Result<Vec<u8>, EnvelopeError> {
        let encoded = match self {
            Self::Reserved(e) => serde_json::to_vec(e),
            Self::Rejected(e) => serde_json::to_vec(e),
        };
        encoded.map_err(|e| EnvelopeError::Encode(e.to_string()))
    }
}

/// A decoded inbound envelope, always in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// `ORDER_CREATED`
    OrderCreated(OrderCreated),
    /// `STOCK_RESERVED`
    StockReserved(StockReserved),
    /// `STOCK_REJECTED`
    StockRejected(StockRejected),
}

/// A payload that parsed as a JSON object but has not been typed yet.
#[derive(Debug, Clone)]
pub struct RawEnvelope {
    fields: Map<String, Value>,
}

impl RawEnvelope {
    /// Parse a payload into a JSON object.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::InvalidJson`] if the bytes are not JSON
    /// - [`EnvelopeError::NotAnObject`] if the JSON is not an object
    pub fn parse(payload: &[u8]) -> Result<Self, EnvelopeError> {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(fields)) => Ok(Self { fields }),
            Ok(_) => Err(EnvelopeError::NotAnObject),
            Err(e) => Err(EnvelopeError::InvalidJson(e.to_string())),
        }
    }

    /// Classify the `eventType` field.
    #[must_use]
    pub fn discriminator(&self) -> Discriminator {
        Discriminator::of(self.fields.get("eventType").and_then(Value::as_str))
    }

    /// `orderId` if present, for logging before the payload is typed.
    #[must_use]
    pub fn order_id(&self) -> Option<&str> {
        self.fields.get("orderId").and_then(Value::as_str)
    }

    /// Decode as a specific event and contract version.
    ///
    /// The `eventType` field is ignored; the caller has already decided what the
    /// payload is (from the discriminator or the routing key). Legacy payloads are
    /// converted into their canonical counterparts.
    ///
    /// # Errors
    ///
    /// - [`EnvelopeError::Shape`] if the payload does not match the envelope
    /// - [`EnvelopeError::MissingField`] if `orderId` is empty
    /// - [`EnvelopeError::InvalidTimestamp`] for unparseable legacy timestamps
    pub fn decode(mut self, event_type: EventType, schema: Schema) -> Result<Inbound, EnvelopeError> {
        self.fields.remove("eventType");

        let inbound = match (event_type, schema) {
            (EventType::OrderCreated, Schema::Canonical) => {
                Inbound::OrderCreated(self.typed::<OrderCreated>(event_type)?)
            }
            (EventType::OrderCreated, Schema::Legacy) => Inbound::OrderCreated(
                self.typed::<LegacyOrderCreated>(event_type)?.try_into()?,
            ),
            (EventType::StockReserved, Schema::Canonical) => {
                Inbound::StockReserved(self.typed::<StockReserved>(event_type)?)
            }
            (EventType::StockReserved, Schema::Legacy) => Inbound::StockReserved(
                self.typed::<LegacyStockReserved>(event_type)?.try_into()?,
            ),
            (EventType::StockRejected, Schema::Canonical) => {
                Inbound::StockRejected(self.typed::<StockRejected>(event_type)?)
            }
            (EventType::StockRejected, Schema::Legacy) => Inbound::StockRejected(
                self.typed::<LegacyStockRejected>(event_type)?.try_into()?,
            ),
        };

        let order_id = match &inbound {
            Inbound::OrderCreated(e) => &e.order_id,
            Inbound::StockReserved(e) => &e.order_id,
            Inbound::StockRejected(e) => &e.order_id,
        };
        if order_id.trim().is_empty() {
            return Err(EnvelopeError::MissingField("orderId"));
        }

        Ok(inbound)
    }

    fn typed<T: DeserializeOwned>(&self, event_type: EventType) -> Result<T, EnvelopeError> {
        serde_json::from_value(Value::Object(self.fields.clone())).map_err(|e| EnvelopeError::Shape {
            event_type: event_type.as_str(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn bytes(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn decodes_canonical_order_created() {
        let payload = bytes(&json!({
            "eventType": "ORDER_CREATED",
            "orderId": "o-1",
            "customerId": "c-1",
            "items": [{ "productId": "P", "quantity": 2, "unitPrice": 9.5 }],
            "timestamp": 1_700_000_000_000_i64
        }));

        let raw = RawEnvelope::parse(&payload).unwrap();
        assert_eq!(
            raw.discriminator(),
            Discriminator::Known(EventType::OrderCreated, Schema::Canonical)
        );

        let Inbound::OrderCreated(order) =
            raw.decode(EventType::OrderCreated, Schema::Canonical).unwrap()
        else {
            panic!("expected OrderCreated");
        };
        let request = order.to_request();
        assert_eq!(request.correlation_id, "o-1");
        assert_eq!(request.items, vec![ReservationItem::new("P", 2)]);
    }

    #[test]
    fn routing_key_decode_ignores_unknown_event_type() {
        let payload = bytes(&json!({
            "eventType": "SOMETHING_ELSE",
            "orderId": "o-1",
            "items": []
        }));
        let raw = RawEnvelope::parse(&payload).unwrap();
        assert_eq!(
            raw.discriminator(),
            Discriminator::Unknown("SOMETHING_ELSE".into())
        );
        assert!(raw.decode(EventType::OrderCreated, Schema::Canonical).is_ok());
    }

    #[test]
    fn rejects_non_json_and_non_objects() {
        assert!(matches!(
            RawEnvelope::parse(b"{not json"),
            Err(EnvelopeError::InvalidJson(_))
        ));
        assert_eq!(
            RawEnvelope::parse(b"[1, 2]").unwrap_err(),
            EnvelopeError::NotAnObject
        );
    }

    #[test]
    fn missing_or_empty_order_id_is_malformed() {
        let raw = RawEnvelope::parse(&bytes(&json!({ "items": [] }))).unwrap();
        assert!(matches!(
            raw.decode(EventType::OrderCreated, Schema::Canonical),
            Err(EnvelopeError::Shape { .. })
        ));

        let raw = RawEnvelope::parse(&bytes(&json!({ "orderId": " ", "items": [] }))).unwrap();
        assert_eq!(
            raw.decode(EventType::OrderCreated, Schema::Canonical).unwrap_err(),
            EnvelopeError::MissingField("orderId")
        );
    }

    #[test]
    fn negative_quantity_is_malformed() {
        let raw = RawEnvelope::parse(&bytes(&json!({
            "orderId": "o-1",
            "items": [{ "productId": "P", "quantity": -1 }]
        })))
        .unwrap();
        assert!(raw.decode(EventType::OrderCreated, Schema::Canonical).is_err());
    }

    #[test]
    fn outcome_envelopes_use_canonical_names() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let reserved = ReservationRequest::new("o-1", None, vec![ReservationItem::new("P", 3)])
            .reserved(at);

        let envelope = OutcomeEnvelope::from_outcome(&reserved);
        assert_eq!(envelope.routing_key(), "stock.reserved");

        let value: Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "eventType": "STOCK_RESERVED",
                "orderId": "o-1",
                "correlationId": "o-1",
                "items": [{ "productId": "P", "quantity": 3 }],
                "timestamp": 1_700_000_000_123_i64
            })
        );

        let rejected = ReservationRequest::new("o-2", Some("c".into()), vec![])
            .rejected("Internal error: boom", at);
        let envelope = OutcomeEnvelope::from_outcome(&rejected);
        assert_eq!(envelope.routing_key(), "stock.rejected");

        let value: Value = serde_json::from_slice(&envelope.to_json().unwrap()).unwrap();
        assert_eq!(value["eventType"], "STOCK_REJECTED");
        assert_eq!(value["reason"], "Internal error: boom");
        assert_eq!(value["correlationId"], "c");
        assert!(value.get("rejectedAt").is_none());
    }

    #[test]
    fn routing_keys_map_back_to_events() {
        assert_eq!(
            EventType::from_routing_key("order.created"),
            Some(EventType::OrderCreated)
        );
        assert_eq!(EventType::from_routing_key("order.cancelled"), None);
    }
}
