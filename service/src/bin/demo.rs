//! End-to-end demo over in-memory collaborators.
//!
//! Runs the inventory and order-side workers against an in-memory broker,
//! ledger and order store, emits a handful of orders, then prints the final
//! stock and order statuses.
//!
//! ```text
//! cargo run -p stockbridge-service --bin demo
//! ```

use anyhow::{Context, bail};
use std::sync::Arc;
use std::time::Duration;
use stockbridge_core::broker::BrokerConnector;
use stockbridge_core::envelope::{EventType, OrderCreated, OrderLine};
use stockbridge_core::topology::BrokerNames;
use stockbridge_core::{Ledger, ReservationEngine};
use stockbridge_runtime::OrderEventEmitter;
use stockbridge_service::{ApplicationBuilder, init_tracing, wiring};
use stockbridge_testing::{InMemoryBroker, InMemoryLedger, InMemoryOrderStatusStore};
use tokio::sync::oneshot;
use tracing::info;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

fn order(order_id: &str, lines: &[(&str, u32)]) -> OrderCreated {
    OrderCreated {
        event_type: EventType::OrderCreated,
        order_id: order_id.to_string(),
        customer_id: Some("demo-customer".to_string()),
        items: lines
            .iter()
            .map(|(product, quantity)| OrderLine {
                product_id: (*product).into(),
                quantity: *quantity,
                unit_price: None,
            })
            .collect(),
        correlation_id: None,
        shipping_address_json: None,
        timestamp: None,
    }
}

async fn wait_for_queues(broker: &InMemoryBroker, names: &BrokerNames) -> anyhow::Result<()> {
    let ready = tokio::time::timeout(SETTLE_TIMEOUT, async {
        while !(broker.has_queue(&names.order_queue) && broker.has_queue(&names.response_queue)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if ready.is_err() {
        bail!("topology was not declared in time");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("stockbridge=info,demo=info");

    let names = BrokerNames::default();
    let broker = InMemoryBroker::new();
    let ledger = Arc::new(InMemoryLedger::seeded(&[("WIDGET", 10), ("GADGET", 5)]));
    let orders = Arc::new(InMemoryOrderStatusStore::new());
    let retry_delay = Duration::from_millis(100);

    let (inventory_manager, inventory_consumer) = wiring::inventory_worker(
        &names,
        Arc::new(broker.clone()),
        ReservationEngine::new(ledger.clone()),
        retry_delay,
        1,
    );
    let (order_manager, order_consumer) =
        wiring::order_side_worker(&names, Arc::new(broker.clone()), orders.clone(), retry_delay);

    let app = ApplicationBuilder::new()
        .with_worker(inventory_manager, inventory_consumer)
        .with_worker(order_manager, order_consumer)
        .build();

    let (done_tx, done_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(app.run_until(async move {
        let _ = done_rx.await;
    }));

    wait_for_queues(&broker, &names).await?;

    let connection = broker.connect().await.context("connecting emitter")?;
    let emitter = OrderEventEmitter::new(
        connection,
        &names.order_exchange,
        &names.order_created_key,
        orders.clone(),
    );

    let demo_orders = [
        order("order-1", &[("WIDGET", 3), ("GADGET", 2)]),
        order("order-2", &[("WIDGET", 8)]),
        order("order-3", &[("SPROCKET", 1)]),
        order("order-4", &[("WIDGET", 7), ("GADGET", 3)]),
    ];
    for event in &demo_orders {
        emitter.emit(event).await.context("emitting order")?;
    }

    let drained = broker.wait_until_drained(&names.order_queue, SETTLE_TIMEOUT).await
        && broker.wait_until_drained(&names.response_queue, SETTLE_TIMEOUT).await;
    if !drained {
        bail!("queues did not drain in time");
    }

    let _ = done_tx.send(());
    let report = running.await.context("joining application")?;
    info!(stopped = report.stopped, "Demo finished");

    println!("Stock:");
    for record in ledger.list().await? {
        println!(
            "  {:<10} available={:<4} reserved={}",
            record.product_id, record.available_stock, record.reserved_stock
        );
    }

    println!("Orders:");
    for record in orders.all() {
        match record.cancellation_reason {
            Some(reason) => println!("  {:<10} {} ({reason})", record.order_id, record.status),
            None => println!("  {:<10} {}", record.order_id, record.status),
        }
    }

    Ok(())
}
