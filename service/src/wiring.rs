//! Explicit construction of the service's workers.
//!
//! Every collaborator is built here and passed by value; nothing is looked up
//! at runtime.

use std::sync::Arc;
use std::time::Duration;
use stockbridge_core::broker::BrokerConnector;
use stockbridge_core::order::OrderStatusStore;
use stockbridge_core::topology::{BrokerNames, Topology};
use stockbridge_core::ReservationEngine;
use stockbridge_runtime::{EventConsumer, InventoryResponseHandler, ReservationHandler, TopologyManager};

/// Inventory side: consume order events and answer with reservation outcomes.
#[must_use]
pub fn inventory_worker(
    names: &BrokerNames,
    connector: Arc<dyn BrokerConnector>,
    engine: ReservationEngine,
    retry_delay: Duration,
    prefetch: u16,
) -> (TopologyManager, EventConsumer) {
    let manager =
        TopologyManager::new(connector, Topology::inventory(names)).with_retry_delay(retry_delay);
    let handler = ReservationHandler::new(engine, &names.response_exchange)
        .with_order_created_key(&names.order_created_key);
    let consumer = EventConsumer::new("inventory", &names.order_queue, Arc::new(handler))
        .with_prefetch(prefetch);
    (manager, consumer)
}

/// Order side: consume reservation outcomes and settle order statuses.
#[must_use]
pub fn order_side_worker(
    names: &BrokerNames,
    connector: Arc<dyn BrokerConnector>,
    store: Arc<dyn OrderStatusStore>,
    retry_delay: Duration,
) -> (TopologyManager, EventConsumer) {
    let manager =
        TopologyManager::new(connector, Topology::order_side(names)).with_retry_delay(retry_delay);
    let handler = InventoryResponseHandler::new(store);
    let consumer = EventConsumer::new("order-side", &names.response_queue, Arc::new(handler));
    (manager, consumer)
}
