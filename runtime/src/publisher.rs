//! Outcome event publisher.
//!
//! Serializes a [`ReservationOutcome`] into its canonical envelope and
//! publishes it, persistent and as `application/json`, to the response
//! exchange under `stock.reserved` or `stock.rejected`. Failures are logged and
//! returned; there is no retry here. The caller has already settled on its
//! decision and acknowledges the inbound message either way.

use crate::metrics::MessageMetrics;
use std::sync::Arc;
use stockbridge_core::ReservationOutcome;
use stockbridge_core::broker::{Broker, BrokerError, OutboundMessage};
use stockbridge_core::envelope::{EnvelopeError, OutcomeEnvelope};
use thiserror::Error;

/// Errors from publishing an outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The outcome could not be serialized
    #[error(transparent)]
    Encode(#[from] EnvelopeError),

    /// The broker refused the message
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Publishes reservation outcomes to the response exchange.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    exchange: String,
}

impl EventPublisher {
    /// Create a publisher over a broker connection.
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
        }
    }

    /// Exchange outcomes are published to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Publish an outcome.
    ///
    /// # Errors
    ///
    /// - [`PublishError::Encode`] if the envelope cannot be serialized
    /// - [`PublishError::Broker`] if the broker refuses the message
    pub async fn publish(&self, outcome: &ReservationOutcome) -> Result<(), PublishError> {
        let envelope = OutcomeEnvelope::from_outcome(outcome);
        let routing_key = envelope.routing_key();

        let payload = envelope.to_json().inspect_err(|e| {
            MessageMetrics::record_publish_error();
            tracing::error!(order_id = %outcome.order_id(), error = %e, "Failed to encode outcome");
        })?;

        let message = OutboundMessage::json(&self.exchange, routing_key, payload);
        match self.broker.publish(message).await {
            Ok(()) => {
                tracing::info!(
                    order_id = %outcome.order_id(),
                    correlation_id = %outcome.correlation_id(),
                    routing_key,
                    "Published reservation outcome"
                );
                Ok(())
            }
            Err(e) => {
                MessageMetrics::record_publish_error();
                tracing::error!(
                    order_id = %outcome.order_id(),
                    correlation_id = %outcome.correlation_id(),
                    routing_key,
                    error = %e,
                    "Failed to publish reservation outcome"
                );
                Err(PublishError::Broker(e))
            }
        }
    }
}
