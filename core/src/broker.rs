//! Message broker port.
//!
//! This module provides the [`Broker`] trait, the smallest surface the
//! reservation flow needs from a message broker, and [`BrokerConnector`],
//! which opens one connection with one channel.
//!
//! # Delivery Semantics
//!
//! - Manual acknowledgement: every [`Delivery`] must be settled with
//!   [`Broker::ack`] or [`Broker::nack`] using its [`DeliveryTag`].
//! - Bounded prefetch: at most `prefetch` deliveries are outstanding per
//!   consumer; the next one arrives only after a settle.
//! - Persistent publishing: outbound messages are marked persistent and
//!   carry `application/json`.
//!
//! # Implementations
//!
//! - `InMemoryBroker` (stockbridge-testing) - topic routing in process
//! - `AmqpBroker` (stockbridge-amqp) - AMQP 0-9-1 via lapin
//!
//! # Example
//!
//! ```rust,ignore
//! use stockbridge_core::broker::{Broker, OutboundMessage};
//!
//! async fn example(broker: &dyn Broker) -> Result<(), BrokerError> {
//!     let mut deliveries = broker.consume("order.queue", 1).await?;
//!     while let Some(delivery) = deliveries.next().await {
//!         let delivery = delivery?;
//!         broker.ack(delivery.tag).await?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::envelope::CONTENT_TYPE;
use crate::topology::Topology;
use futures::Stream;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// Declaring exchanges, queues or bindings failed
    #[error("Topology declaration failed for '{name}': {reason}")]
    Topology {
        /// Exchange, queue or binding that failed
        name: String,
        /// The reason for failure
        reason: String,
    },

    /// Starting or continuing a consumer failed
    #[error("Consume failed for queue '{queue}': {reason}")]
    Consume {
        /// Queue being consumed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Publishing a message failed
    #[error("Publish failed to '{exchange}' with key '{routing_key}': {reason}")]
    Publish {
        /// Target exchange
        exchange: String,
        /// Routing key used
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Acknowledging or rejecting a delivery failed
    #[error("Acknowledgement failed for delivery {tag}: {reason}")]
    Acknowledge {
        /// Delivery being settled
        tag: DeliveryTag,
        /// The reason for failure
        reason: String,
    },

    /// The connection or channel is closed
    #[error("Broker connection closed")]
    Closed,
}

/// Channel-scoped identifier of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeliveryTag(pub u64);

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Handle used to settle this delivery
    pub tag: DeliveryTag,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Raw message body
    pub payload: Vec<u8>,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Target exchange
    pub exchange: String,
    /// Routing key
    pub routing_key: String,
    /// Message body
    pub payload: Vec<u8>,
    /// MIME type of the body
    pub content_type: String,
    /// Whether the broker should write the message to disk
    pub persistent: bool,
}

impl OutboundMessage {
    /// A persistent JSON message.
    #[must_use]
    pub fn json(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            content_type: CONTENT_TYPE.to_string(),
            persistent: true,
        }
    }
}

/// Stream of deliveries from one queue.
///
/// The stream ends when the connection or channel goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Minimal message broker port.
///
/// Methods return boxed futures so the trait stays dyn-compatible
/// (`Arc<dyn Broker>`). One instance wraps one connection and one channel.
pub trait Broker: Send + Sync {
    /// Declare exchanges, then queues, then bindings.
    ///
    /// Declarations are idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Topology`] naming the first declaration that failed.
    fn declare_topology<'a>(&'a self, topology: &'a Topology) -> BrokerFuture<'a, ()>;

    /// Start consuming `queue` with manual acknowledgement and the given prefetch.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Consume`] if the consumer cannot be registered.
    fn consume<'a>(&'a self, queue: &'a str, prefetch: u16) -> BrokerFuture<'a, DeliveryStream>;

    /// Publish a message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Publish`] if the broker refuses or the channel fails.
    fn publish(&self, message: OutboundMessage) -> BrokerFuture<'_, ()>;

    /// Acknowledge a delivery, removing it from its queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledge`] if the tag is unknown or the channel fails.
    fn ack(&self, tag: DeliveryTag) -> BrokerFuture<'_, ()>;

    /// Negatively acknowledge a delivery, optionally putting it back on its queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Acknowledge`] if the tag is unknown or the channel fails.
    fn nack(&self, tag: DeliveryTag, requeue: bool) -> BrokerFuture<'_, ()>;

    /// Close the channel, then the connection.
    ///
    /// # Errors
    ///
    /// Returns the first close failure; callers treat this as best effort.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Opens broker connections.
pub trait BrokerConnector: Send + Sync {
    /// Open one connection with one channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Unavailable`] if the broker cannot be reached.
    fn connect(&self) -> BrokerFuture<'_, Arc<dyn Broker>>;

    /// Human-readable endpoint for logs, without credentials.
    fn endpoint(&self) -> String;
}
