//! Supervised workers over the in-memory broker: reconnects, retries and
//! graceful shutdown.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;
use stockbridge_core::ReservationEngine;
use stockbridge_core::broker::BrokerConnector;
use stockbridge_core::envelope::{EventType, OrderCreated, OrderLine};
use stockbridge_core::order::{OrderStatus, STOCK_UNAVAILABLE_REASON};
use stockbridge_core::topology::BrokerNames;
use stockbridge_runtime::OrderEventEmitter;
use stockbridge_service::{ApplicationBuilder, ShutdownReport, wiring};
use stockbridge_testing::{InMemoryBroker, InMemoryLedger, InMemoryOrderStatusStore, helpers};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const RETRY: Duration = Duration::from_millis(20);
const WAIT: Duration = Duration::from_secs(5);

struct Running {
    stop: oneshot::Sender<()>,
    task: JoinHandle<ShutdownReport>,
}

impl Running {
    async fn stop(self) -> ShutdownReport {
        self.stop.send(()).unwrap();
        self.task.await.unwrap()
    }
}

fn start(builder: ApplicationBuilder) -> Running {
    let (stop, stopped) = oneshot::channel::<()>();
    let app = builder.with_shutdown_timeout(WAIT).build();
    let task = tokio::spawn(app.run_until(async move {
        let _ = stopped.await;
    }));
    Running { stop, task }
}

fn inventory(broker: &InMemoryBroker, ledger: &Arc<InMemoryLedger>) -> ApplicationBuilder {
    let (manager, consumer) = wiring::inventory_worker(
        &BrokerNames::default(),
        Arc::new(broker.clone()),
        ReservationEngine::new(ledger.clone()),
        RETRY,
        1,
    );
    ApplicationBuilder::new().with_worker(manager, consumer)
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn available(ledger: &InMemoryLedger, product: &str) -> u32 {
    ledger.snapshot(product).await.unwrap().available_stock
}

fn order(order_id: &str, product: &str, quantity: u32) -> OrderCreated {
    OrderCreated {
        event_type: EventType::OrderCreated,
        order_id: order_id.to_string(),
        customer_id: None,
        items: vec![OrderLine {
            product_id: product.into(),
            quantity,
            unit_price: None,
        }],
        correlation_id: None,
        shipping_address_json: None,
        timestamp: None,
    }
}

#[tokio::test]
async fn declares_topology_then_reserves() {
    helpers::init_tracing();
    let broker = InMemoryBroker::new();
    let ledger = Arc::new(InMemoryLedger::seeded(&[("P", 10)]));
    let running = start(inventory(&broker, &ledger));

    eventually(|| broker.has_queue("order.queue")).await;
    broker
        .inject("order.exchange", "order.created", helpers::order_created("o-1", &[("P", 4)]))
        .unwrap();
    assert!(broker.wait_until_drained("order.queue", WAIT).await);

    assert_eq!(available(&ledger, "P").await, 6);
    let report = running.stop().await;
    assert!(report.is_clean());
    assert_eq!(report.stopped, 1);
    assert!(broker.close_calls() >= 1);
}

#[tokio::test]
async fn retries_until_the_broker_accepts() {
    helpers::init_tracing();
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(3);
    let ledger = Arc::new(InMemoryLedger::seeded(&[("P", 10)]));
    let running = start(inventory(&broker, &ledger));

    eventually(|| broker.has_queue("order.queue")).await;
    assert_eq!(broker.connect_attempts(), 4);

    running.stop().await;
}

#[tokio::test]
async fn reconnects_after_the_connection_drops() {
    helpers::init_tracing();
    let broker = InMemoryBroker::new();
    let ledger = Arc::new(InMemoryLedger::seeded(&[("P", 10)]));
    let running = start(inventory(&broker, &ledger));

    eventually(|| broker.has_queue("order.queue")).await;
    broker
        .inject("order.exchange", "order.created", helpers::order_created("o-1", &[("P", 2)]))
        .unwrap();
    assert!(broker.wait_until_drained("order.queue", WAIT).await);

    broker.disconnect_all();
    eventually(|| broker.connect_attempts() >= 2).await;

    broker
        .inject("order.exchange", "order.created", helpers::order_created("o-2", &[("P", 3)]))
        .unwrap();
    assert!(broker.wait_until_drained("order.queue", WAIT).await);

    assert_eq!(available(&ledger, "P").await, 5);
    assert!(running.stop().await.is_clean());
}

#[tokio::test]
async fn shutdown_interrupts_connection_retries() {
    helpers::init_tracing();
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(usize::MAX);
    let ledger = Arc::new(InMemoryLedger::seeded(&[("P", 1)]));
    let running = start(inventory(&broker, &ledger));

    eventually(|| broker.connect_attempts() >= 2).await;
    let report = running.stop().await;

    assert_eq!(
        report,
        ShutdownReport {
            stopped: 1,
            failed: 0,
            timed_out: 0
        }
    );
    assert!(!broker.has_queue("order.queue"));
}

#[tokio::test]
async fn shutdown_handle_stops_the_application() {
    helpers::init_tracing();
    let broker = InMemoryBroker::new();
    let ledger = Arc::new(InMemoryLedger::seeded(&[("P", 1)]));
    let app = inventory(&broker, &ledger).build();
    let handle = app.shutdown_handle();
    let task = tokio::spawn(app.run_until(std::future::pending()));

    eventually(|| broker.has_queue("order.queue")).await;
    handle.send(()).unwrap();

    let report = tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    assert!(report.is_clean());
}

#[tokio::test]
async fn order_side_settles_orders_from_outcomes() {
    helpers::init_tracing();
    let names = BrokerNames::default();
    let broker = InMemoryBroker::new();
    let ledger = Arc::new(InMemoryLedger::seeded(&[("P", 5)]));
    let orders = Arc::new(InMemoryOrderStatusStore::new());

    let (order_manager, order_consumer) =
        wiring::order_side_worker(&names, Arc::new(broker.clone()), orders.clone(), RETRY);
    let running = start(inventory(&broker, &ledger).with_worker(order_manager, order_consumer));

    eventually(|| broker.has_queue(&names.order_queue) && broker.has_queue(&names.response_queue))
        .await;

    let emitter = OrderEventEmitter::new(
        broker.connect().await.unwrap(),
        &names.order_exchange,
        &names.order_created_key,
        orders.clone(),
    );
    emitter.emit(&order("o-1", "P", 2)).await.unwrap();
    emitter.emit(&order("o-2", "P", 10)).await.unwrap();

    eventually(|| {
        orders.status("o-1") != Some(OrderStatus::Pending)
            && orders.status("o-2") != Some(OrderStatus::Pending)
    })
    .await;

    assert_eq!(orders.status("o-1"), Some(OrderStatus::Confirmed));
    let cancelled = orders
        .all()
        .into_iter()
        .find(|record| record.order_id == "o-2")
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some(STOCK_UNAVAILABLE_REASON)
    );
    assert_eq!(available(&ledger, "P").await, 3);

    let report = running.stop().await;
    assert_eq!(report.stopped, 2);
}
