//! # Stockbridge Runtime
//!
//! The moving parts of the inventory reservation flow, written against the
//! ports in `stockbridge-core`:
//!
//! - [`topology::TopologyManager`]: connect, declare exchanges and queues, retry
//! - [`consumer::EventConsumer`]: consume one queue, settle every delivery
//! - [`reservation::ReservationHandler`]: `ORDER_CREATED` → validate → reserve → outcome
//! - [`publisher::EventPublisher`]: `STOCK_RESERVED` / `STOCK_REJECTED` out
//! - [`order_side`]: the order service's emitter and response handler
//! - [`metrics`]: Prometheus exporter and recorders
//!
//! ## Example
//!
//! ```ignore
//! let manager = TopologyManager::new(connector, Topology::inventory(&names));
//! let handler = Arc::new(ReservationHandler::new(engine, &names.response_exchange));
//! let consumer = EventConsumer::new("inventory", &names.order_queue, handler);
//!
//! if let Some(broker) = manager.establish(&mut shutdown_rx).await {
//!     consumer.run(broker.clone(), &mut shutdown_rx).await?;
//!     TopologyManager::shutdown(broker.as_ref()).await;
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod metrics;
pub mod order_side;
pub mod publisher;
pub mod reservation;
pub mod topology;

pub use consumer::{DeliveryHandler, Disposition, EventConsumer, StopReason};
pub use order_side::{EmitError, InventoryResponseHandler, OrderEventEmitter};
pub use publisher::{EventPublisher, PublishError};
pub use reservation::{Dispatch, ProcessingReport, ReservationHandler};
pub use topology::TopologyManager;
