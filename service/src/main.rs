//! Inventory service.
//!
//! Consumes `ORDER_CREATED` events, reserves stock in `PostgreSQL` and
//! publishes `STOCK_RESERVED` / `STOCK_REJECTED` outcomes.

use anyhow::Context;
use std::sync::Arc;
use stockbridge_amqp::AmqpConnector;
use stockbridge_core::ReservationEngine;
use stockbridge_postgres::PostgresLedger;
use stockbridge_runtime::metrics::MetricsServer;
use stockbridge_service::{ApplicationBuilder, Config, init_tracing, wiring};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("stockbridge=info,inventory_service=info");

    info!("Starting inventory service");

    let config = Config::from_env();
    let names = config.broker_names();
    info!(
        order_exchange = %names.order_exchange,
        order_queue = %names.order_queue,
        response_exchange = %names.response_exchange,
        prefetch = config.broker.prefetch,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.server.metrics_addr);
    metrics.start().context("starting metrics exporter")?;

    info!("Connecting to stock database...");
    let pool = stockbridge_postgres::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to PostgreSQL")?;
    stockbridge_postgres::migrate(&pool)
        .await
        .context("running migrations")?;
    info!("Stock database ready");

    let ledger = PostgresLedger::new(pool).with_lock_timeout(config.lock_timeout());
    let engine = ReservationEngine::new(Arc::new(ledger));

    let connector = AmqpConnector::builder()
        .uri(&config.broker.url)
        .connection_name("inventory-service")
        .build();

    let (manager, consumer) = wiring::inventory_worker(
        &names,
        Arc::new(connector),
        engine,
        config.retry_delay(),
        config.broker.prefetch,
    );

    let report = ApplicationBuilder::new()
        .with_worker(manager, consumer)
        .with_shutdown_timeout(config.shutdown_timeout())
        .build()
        .run()
        .await;

    info!(
        stopped = report.stopped,
        timed_out = report.timed_out,
        "Inventory service stopped"
    );
    Ok(())
}
