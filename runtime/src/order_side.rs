//! Order-service half of the flow.
//!
//! [`OrderEventEmitter`] records a new order as `PENDING` and publishes its
//! `ORDER_CREATED` event. [`InventoryResponseHandler`] consumes the inventory
//! outcomes and settles the order: `STOCK_RESERVED` confirms it,
//! `STOCK_REJECTED` cancels it. Only pending orders move.

use crate::consumer::{DeliveryHandler, Disposition, HandlerFuture};
use crate::metrics::{MessageMetrics, OrderMetrics};
use std::sync::Arc;
use stockbridge_core::broker::{Broker, BrokerError, Delivery, OutboundMessage};
use stockbridge_core::envelope::{
    Discriminator, EnvelopeError, EventType, Inbound, OrderCreated, RawEnvelope, Schema,
};
use stockbridge_core::order::{
    OrderStatus, OrderStatusStore, OrderStoreError, STOCK_UNAVAILABLE_REASON,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from emitting an order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// The order could not be recorded
    #[error(transparent)]
    Store(#[from] OrderStoreError),

    /// The event could not be serialized
    #[error(transparent)]
    Encode(#[from] EnvelopeError),

    /// The broker refused the event
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Records orders and announces them to the inventory service.
pub struct OrderEventEmitter {
    broker: Arc<dyn Broker>,
    exchange: String,
    routing_key: String,
    store: Arc<dyn OrderStatusStore>,
}

impl OrderEventEmitter {
    /// Create an emitter publishing to `exchange` under `routing_key`.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        store: Arc<dyn OrderStatusStore>,
    ) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            store,
        }
    }

    /// Record the order as `PENDING` and publish `ORDER_CREATED`.
    ///
    /// A missing correlation id is set to the order id.
    ///
    /// # Errors
    ///
    /// - [`EmitError::Store`] if the order already exists or cannot be stored
    /// - [`EmitError::Encode`] if the event cannot be serialized
    /// - [`EmitError::Broker`] if the broker refuses the event
    pub async fn emit(&self, order: &OrderCreated) -> Result<(), EmitError> {
        let mut event = order.clone();
        event.event_type = EventType::OrderCreated;
        if event.correlation_id.as_deref().is_none_or(str::is_empty) {
            event.correlation_id = Some(event.order_id.clone());
        }

        self.store.insert_pending(&event.order_id).await?;

        let payload =
            serde_json::to_vec(&event).map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        self.broker
            .publish(OutboundMessage::json(&self.exchange, &self.routing_key, payload))
            .await?;

        info!(
            order_id = %event.order_id,
            items = event.items.len(),
            routing_key = %self.routing_key,
            "Order created event published"
        );
        Ok(())
    }
}

/// Applies inventory outcomes to order statuses.
pub struct InventoryResponseHandler {
    store: Arc<dyn OrderStatusStore>,
}

impl InventoryResponseHandler {
    /// Create a handler over an order store.
    #[must_use]
    pub fn new(store: Arc<dyn OrderStatusStore>) -> Self {
        Self { store }
    }

    fn decode(delivery: &Delivery) -> Result<Option<Inbound>, Disposition> {
        let raw = match RawEnvelope::parse(&delivery.payload) {
            Ok(raw) => raw,
            Err(e) => {
                MessageMetrics::record_dropped("malformed");
                warn!(routing_key = %delivery.routing_key, error = %e, "Malformed inventory response");
                return Err(Disposition::Ack);
            }
        };

        let (event_type, schema) = match raw.discriminator() {
            Discriminator::Known(event_type, schema) => (event_type, schema),
            Discriminator::Unknown(_) | Discriminator::Missing => {
                match EventType::from_routing_key(&delivery.routing_key) {
                    Some(event_type) => (event_type, Schema::Canonical),
                    None => {
                        if delivery.redelivered {
                            MessageMetrics::record_dropped("unroutable");
                        } else {
                            MessageMetrics::record_requeued();
                        }
                        warn!(
                            routing_key = %delivery.routing_key,
                            redelivered = delivery.redelivered,
                            "Unroutable inventory response"
                        );
                        return Err(Disposition::requeue_once(delivery.redelivered));
                    }
                }
            }
        };

        if event_type == EventType::OrderCreated {
            return Ok(None);
        }

        raw.decode(event_type, schema).map(Some).map_err(|e| {
            MessageMetrics::record_dropped("malformed");
            warn!(routing_key = %delivery.routing_key, error = %e, "Malformed inventory response");
            Disposition::Ack
        })
    }

    /// Apply one outcome to the order store.
    pub async fn apply(&self, order_id: &str, to: OrderStatus, reason: Option<String>, redelivered: bool) -> Disposition {
        match self.store.transition(order_id, to, reason).await {
            Ok(record) => {
                OrderMetrics::record_transition(record.status.as_str());
                info!(order_id = %order_id, status = %record.status, "Order status updated");
                Disposition::Ack
            }
            Err(OrderStoreError::NotFound(_)) => {
                warn!(order_id = %order_id, status = %to, "Inventory response for unknown order");
                Disposition::Ack
            }
            Err(OrderStoreError::InvalidTransition { from, .. }) => {
                warn!(order_id = %order_id, from = %from, to = %to, "Order is no longer pending, ignoring response");
                Disposition::Ack
            }
            Err(e @ OrderStoreError::AlreadyExists(_)) => {
                warn!(order_id = %order_id, error = %e, "Unexpected order store response");
                Disposition::Ack
            }
            Err(e @ OrderStoreError::Storage(_)) => {
                warn!(order_id = %order_id, error = %e, redelivered, "Order store unavailable");
                Disposition::requeue_once(redelivered)
            }
        }
    }
}

impl DeliveryHandler for InventoryResponseHandler {
    fn name(&self) -> &'static str {
        "inventory-response"
    }

    fn handle<'a>(&'a self, _broker: &'a Arc<dyn Broker>, delivery: &'a Delivery) -> HandlerFuture<'a> {
        Box::pin(async move {
            let inbound = match Self::decode(delivery) {
                Ok(Some(inbound)) => inbound,
                Ok(None) => {
                    MessageMetrics::record_dropped("foreign");
                    warn!(routing_key = %delivery.routing_key, "Order event on the response queue, acknowledging");
                    return Disposition::Ack;
                }
                Err(disposition) => return disposition,
            };

            match inbound {
                Inbound::StockReserved(event) => {
                    debug!(order_id = %event.order_id, correlation_id = %event.correlation_id, "Stock reserved");
                    self.apply(&event.order_id, OrderStatus::Confirmed, None, delivery.redelivered)
                        .await
                }
                Inbound::StockRejected(event) => {
                    info!(
                        order_id = %event.order_id,
                        correlation_id = %event.correlation_id,
                        reason = %event.reason,
                        "Stock rejected"
                    );
                    self.apply(
                        &event.order_id,
                        OrderStatus::Cancelled,
                        Some(STOCK_UNAVAILABLE_REASON.to_string()),
                        delivery.redelivered,
                    )
                    .await
                }
                Inbound::OrderCreated(_) => Disposition::Ack,
            }
        })
    }
}
