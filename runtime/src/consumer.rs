//! Generic queue consumer.
//!
//! [`EventConsumer`] owns the consume loop for one queue on one connection: it
//! pulls deliveries, hands each to a [`DeliveryHandler`], and settles the
//! delivery with the handler's [`Disposition`]. Handlers never touch ack/nack
//! themselves.
//!
//! ```text
//! consume(queue, prefetch)
//! loop {
//!     select {
//!         shutdown        => stop
//!         next delivery   => handle -> ack | nack(requeue)
//!         stream ended    => stop (connection lost)
//!     }
//! }
//! ```
//!
//! A delivery that has started processing is always finished and settled
//! before the loop looks at the shutdown signal again.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = EventConsumer::new("inventory", "order.queue", handler).with_prefetch(1);
//! let reason = consumer.run(broker, &mut shutdown_rx).await?;
//! ```

use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use stockbridge_core::broker::{Broker, BrokerError, Delivery};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// How a delivery should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge; the message is done
    Ack,
    /// Negative acknowledge
    Nack {
        /// Whether the broker should put the message back on the queue
        requeue: bool,
    },
}

impl Disposition {
    /// Nack that requeues a first delivery and discards a redelivery.
    #[must_use]
    pub const fn requeue_once(redelivered: bool) -> Self {
        Self::Nack {
            requeue: !redelivered,
        }
    }
}

/// Why [`EventConsumer::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// A shutdown signal was received
    Shutdown,
    /// The broker closed the delivery stream
    StreamEnded,
}

/// Boxed future returned by [`DeliveryHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Disposition> + Send + 'a>>;

/// Processes one delivery and decides how to settle it.
///
/// Handlers receive the broker connection the delivery arrived on so they can
/// publish follow-up events on the same connection.
pub trait DeliveryHandler: Send + Sync {
    /// Handler name, used in logs.
    fn name(&self) -> &str;

    /// Handle a delivery.
    fn handle<'a>(&'a self, broker: &'a Arc<dyn Broker>, delivery: &'a Delivery) -> HandlerFuture<'a>;
}

/// Consumes one queue and dispatches deliveries to a handler.
#[derive(Clone)]
pub struct EventConsumer {
    /// Consumer name (for logging)
    name: String,

    /// Queue to consume
    queue: String,

    /// Unacknowledged deliveries the broker may hand out at once
    prefetch: u16,

    /// Handler for processing deliveries
    handler: Arc<dyn DeliveryHandler>,
}

impl EventConsumer {
    /// Create a consumer with a prefetch of one.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            prefetch: 1,
            handler,
        }
    }

    /// Set the prefetch count (minimum 1).
    #[must_use]
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Consumer name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue consumed.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Prefetch count.
    #[must_use]
    pub const fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Consume until shutdown or until the broker ends the stream.
    ///
    /// # Errors
    ///
    /// Returns the broker error if consuming cannot start or the stream
    /// yields an error.
    pub async fn run(
        &self,
        broker: Arc<dyn Broker>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<StopReason, BrokerError> {
        let mut stream = broker.consume(&self.queue, self.prefetch).await?;
        info!(
            consumer = %self.name,
            queue = %self.queue,
            prefetch = self.prefetch,
            handler = self.handler.name(),
            "Consumer started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!(consumer = %self.name, "Consumer received shutdown signal");
                    return Ok(StopReason::Shutdown);
                }
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        self.process(&broker, &delivery).await;
                    }
                    Some(Err(e)) => {
                        error!(consumer = %self.name, error = %e, "Error receiving delivery");
                        return Err(e);
                    }
                    None => {
                        warn!(consumer = %self.name, queue = %self.queue, "Delivery stream ended");
                        return Ok(StopReason::StreamEnded);
                    }
                },
            }
        }
    }

    /// Handle one delivery and settle it.
    ///
    /// Settlement failures are logged; the broker redelivers unsettled
    /// messages once the connection goes away.
    pub async fn process(&self, broker: &Arc<dyn Broker>, delivery: &Delivery) -> Disposition {
        debug!(
            consumer = %self.name,
            tag = %delivery.tag,
            routing_key = %delivery.routing_key,
            redelivered = delivery.redelivered,
            "Received delivery"
        );

        let disposition = self.handler.handle(broker, delivery).await;

        let settled = match disposition {
            Disposition::Ack => broker.ack(delivery.tag).await,
            Disposition::Nack { requeue } => broker.nack(delivery.tag, requeue).await,
        };
        match settled {
            Ok(()) => debug!(consumer = %self.name, tag = %delivery.tag, ?disposition, "Delivery settled"),
            Err(e) => error!(
                consumer = %self.name,
                tag = %delivery.tag,
                ?disposition,
                error = %e,
                "Failed to settle delivery"
            ),
        }

        disposition
    }
}
