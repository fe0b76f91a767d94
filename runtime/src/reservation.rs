//! Inventory-side delivery handler.
//!
//! [`ReservationHandler`] turns `ORDER_CREATED` deliveries into reservation
//! outcomes:
//!
//! ```text
//! payload ── not a JSON object ──────────────────────────► ack (malformed)
//!    │
//! eventType ── ORDER_CREATED / OrderCreated ─► decode ───► process ─► ack
//!    │      └─ another known event ──────────────────────► ack (foreign)
//!    │
//! (missing / unknown) routing key
//!    ├─ order.created ─► decode (canonical) ─► process ─► ack
//!    ├─ another known key ───────────────────────────────► ack (foreign)
//!    └─ anything else ─────────────────────► nack, requeue on first delivery only
//! ```
//!
//! Processing never fails the delivery: every order gets exactly one outcome
//! (reserved or rejected), a panic included, and the delivery is acknowledged
//! even when the outcome cannot be published.

use crate::consumer::{DeliveryHandler, Disposition, HandlerFuture};
use crate::metrics::{MessageMetrics, RejectionKind, ReservationMetrics};
use crate::publisher::{EventPublisher, PublishError};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use stockbridge_core::broker::{Broker, Delivery};
use stockbridge_core::envelope::{
    Discriminator, EnvelopeError, EventType, Inbound, OrderCreated, RawEnvelope, Schema,
};
use stockbridge_core::environment::{Clock, SystemClock};
use stockbridge_core::topology::ORDER_CREATED_KEY;
use stockbridge_core::{Availability, ReservationEngine, ReservationOutcome, ReservationRequest};
use tracing::{debug, error, info, warn};

/// What a delivery turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// An order to reserve stock for
    Order(OrderCreated),
    /// A known event meant for another consumer
    Foreign(EventType),
    /// Not a usable envelope
    Malformed {
        /// Why the payload was refused
        error: EnvelopeError,
        /// `orderId` when the payload carried one
        order_id: Option<String>,
    },
    /// Neither the event type nor the routing key identify the message
    Unroutable,
}

/// Result of processing one order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingReport {
    /// Decision taken for the order
    pub outcome: ReservationOutcome,
    /// Whether the outcome reached the broker
    pub published: Result<(), PublishError>,
}

enum Decision {
    Reserved,
    Rejected(RejectionKind, String),
}

/// Handles `ORDER_CREATED` deliveries on the inventory queue.
pub struct ReservationHandler {
    engine: ReservationEngine,
    response_exchange: String,
    order_created_key: String,
    clock: Arc<dyn Clock>,
}

impl ReservationHandler {
    /// Create a handler publishing outcomes to `response_exchange`.
    #[must_use]
    pub fn new(engine: ReservationEngine, response_exchange: impl Into<String>) -> Self {
        Self {
            engine,
            response_exchange: response_exchange.into(),
            order_created_key: ORDER_CREATED_KEY.to_string(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different clock for outcome timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Routing key that identifies orders when `eventType` does not.
    #[must_use]
    pub fn with_order_created_key(mut self, key: impl Into<String>) -> Self {
        self.order_created_key = key.into();
        self
    }

    /// Classify a delivery.
    #[must_use]
    pub fn dispatch(&self, delivery: &Delivery) -> Dispatch {
        let raw = match RawEnvelope::parse(&delivery.payload) {
            Ok(raw) => raw,
            Err(error) => {
                return Dispatch::Malformed {
                    error,
                    order_id: None,
                };
            }
        };

        let (event_type, schema) = match raw.discriminator() {
            Discriminator::Known(event_type, schema) => (event_type, schema),
            Discriminator::Unknown(_) | Discriminator::Missing => {
                if delivery.routing_key == self.order_created_key {
                    (EventType::OrderCreated, Schema::Canonical)
                } else if let Some(event_type) = EventType::from_routing_key(&delivery.routing_key) {
                    return Dispatch::Foreign(event_type);
                } else {
                    return Dispatch::Unroutable;
                }
            }
        };

        if event_type != EventType::OrderCreated {
            return Dispatch::Foreign(event_type);
        }

        match raw.clone().decode(event_type, schema) {
            Ok(Inbound::OrderCreated(order)) => Dispatch::Order(order),
            Ok(_) => Dispatch::Foreign(event_type),
            Err(error) => Dispatch::Malformed {
                error,
                order_id: raw.order_id().map(str::to_string),
            },
        }
    }

    /// Decide an order: validate, then reserve.
    ///
    /// Always produces an outcome. A panic while deciding becomes an internal
    /// rejection.
    pub async fn decide(&self, order: &OrderCreated) -> ReservationOutcome {
        let started = Instant::now();
        let request = order.to_request();

        let decision = AssertUnwindSafe(self.evaluate(&request))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Decision::Rejected(
                    RejectionKind::Internal,
                    format!("Internal error: {}", panic_message(panic.as_ref())),
                )
            });

        let now = self.clock.now();
        match decision {
            Decision::Reserved => {
                ReservationMetrics::record_reserved(started.elapsed());
                info!(
                    order_id = %request.order_id,
                    correlation_id = %request.correlation_id,
                    items = request.items.len(),
                    "Stock reserved"
                );
                request.reserved(now)
            }
            Decision::Rejected(kind, reason) => {
                ReservationMetrics::record_rejected(kind, started.elapsed());
                match kind {
                    RejectionKind::Internal => error!(
                        order_id = %request.order_id,
                        correlation_id = %request.correlation_id,
                        reason = %reason,
                        "Reservation failed"
                    ),
                    RejectionKind::Business | RejectionKind::Empty => info!(
                        order_id = %request.order_id,
                        correlation_id = %request.correlation_id,
                        reason = %reason,
                        "Stock rejected"
                    ),
                }
                request.rejected(reason, now)
            }
        }
    }

    async fn evaluate(&self, request: &ReservationRequest) -> Decision {
        if request.items.is_empty() {
            return Decision::Rejected(
                RejectionKind::Empty,
                format!("Order {} contains no items", request.order_id),
            );
        }

        match self.engine.validate_availability(&request.items).await {
            Ok(Availability::Available) => {}
            Ok(Availability::Unavailable { reason, .. }) => {
                return Decision::Rejected(RejectionKind::Business, reason);
            }
            Err(e) => {
                return Decision::Rejected(RejectionKind::Internal, format!("Internal error: {e}"));
            }
        }

        match self.engine.reserve(&request.items).await {
            Ok(()) => Decision::Reserved,
            Err(e) if e.is_business_rejection() => {
                Decision::Rejected(RejectionKind::Business, e.to_string())
            }
            Err(e) => Decision::Rejected(RejectionKind::Internal, format!("Internal error: {e}")),
        }
    }

    /// Decide an order and publish the outcome on `broker`.
    pub async fn process(&self, broker: &Arc<dyn Broker>, order: &OrderCreated) -> ProcessingReport {
        let outcome = self.decide(order).await;
        let published = EventPublisher::new(broker.clone(), self.response_exchange.clone())
            .publish(&outcome)
            .await;
        ProcessingReport { outcome, published }
    }
}

impl DeliveryHandler for ReservationHandler {
    fn name(&self) -> &'static str {
        "reservation"
    }

    fn handle<'a>(&'a self, broker: &'a Arc<dyn Broker>, delivery: &'a Delivery) -> HandlerFuture<'a> {
        Box::pin(async move {
            match self.dispatch(delivery) {
                Dispatch::Order(order) => {
                    debug!(order_id = %order.order_id, "Processing order");
                    let report = self.process(broker, &order).await;
                    if let Err(e) = &report.published {
                        warn!(
                            order_id = %order.order_id,
                            error = %e,
                            "Outcome not published, acknowledging order anyway"
                        );
                    }
                    Disposition::Ack
                }
                Dispatch::Foreign(event_type) => {
                    MessageMetrics::record_dropped("foreign");
                    warn!(
                        event_type = event_type.as_str(),
                        routing_key = %delivery.routing_key,
                        "Event not handled by this consumer, acknowledging"
                    );
                    Disposition::Ack
                }
                Dispatch::Malformed { error, order_id } => {
                    MessageMetrics::record_dropped("malformed");
                    warn!(
                        order_id = order_id.as_deref().unwrap_or("-"),
                        routing_key = %delivery.routing_key,
                        error = %error,
                        "Malformed envelope, acknowledging"
                    );
                    Disposition::Ack
                }
                Dispatch::Unroutable => {
                    let disposition = Disposition::requeue_once(delivery.redelivered);
                    if delivery.redelivered {
                        MessageMetrics::record_dropped("unroutable");
                    } else {
                        MessageMetrics::record_requeued();
                    }
                    warn!(
                        routing_key = %delivery.routing_key,
                        redelivered = delivery.redelivered,
                        "Unroutable message"
                    );
                    disposition
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic while processing order".to_string()
    }
}
