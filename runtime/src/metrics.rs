//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the reservation flow:
//! - Reservation outcomes and decision latency
//! - Dropped, requeued and unpublished messages
//! - Broker connection attempts
//! - Order status transitions
//!
//! # Example
//!
//! ```rust,no_run
//! use stockbridge_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the recorder and spawn the HTTP exporter.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves the existing recorder in place.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        self.handle = Some(handle);
        let addr = self.addr;
        tokio::spawn(async move {
            if exporter.await.is_err() {
                tracing::error!(addr = %addr, "Metrics exporter stopped");
            }
        });
        tracing::info!(addr = %self.addr, "Metrics server started");
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "reservations_reserved_total",
        "Orders whose stock was reserved"
    );
    describe_counter!(
        "reservations_rejected_total",
        "Orders whose stock was rejected, by rejection kind"
    );
    describe_histogram!(
        "reservation_duration_seconds",
        "Time from delivery to decision"
    );
    describe_counter!(
        "messages_dropped_total",
        "Deliveries acknowledged without processing, by cause"
    );
    describe_counter!(
        "messages_requeued_total",
        "Deliveries negatively acknowledged with requeue"
    );
    describe_counter!(
        "outcome_publish_errors_total",
        "Outcome events that could not be published"
    );
    describe_counter!(
        "broker_connect_attempts_total",
        "Broker connection attempts, by result"
    );
    describe_counter!(
        "order_status_transitions_total",
        "Order status changes applied from inventory outcomes"
    );
    describe_counter!(
        "ledger_transactions_total",
        "Locked ledger transactions, by result"
    );
}

/// Kind of rejection, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Not enough stock, unknown product, bad quantity
    Business,
    /// Ledger fault, panic
    Internal,
    /// Order without items
    Empty,
}

impl RejectionKind {
    const fn label(self) -> &'static str {
        match self {
            Self::Business => "business",
            Self::Internal => "internal",
            Self::Empty => "empty",
        }
    }
}

/// Reservation decision metrics recorder.
pub struct ReservationMetrics;

impl ReservationMetrics {
    /// Record a successful reservation.
    pub fn record_reserved(duration: Duration) {
        counter!("reservations_reserved_total").increment(1);
        histogram!("reservation_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rejection.
    pub fn record_rejected(kind: RejectionKind, duration: Duration) {
        counter!("reservations_rejected_total", "reason" => kind.label()).increment(1);
        histogram!("reservation_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Message handling metrics recorder.
pub struct MessageMetrics;

impl MessageMetrics {
    /// Record a delivery acknowledged without processing.
    pub fn record_dropped(cause: &'static str) {
        counter!("messages_dropped_total", "cause" => cause).increment(1);
    }

    /// Record a delivery sent back to its queue.
    pub fn record_requeued() {
        counter!("messages_requeued_total").increment(1);
    }

    /// Record an outcome that could not be published.
    pub fn record_publish_error() {
        counter!("outcome_publish_errors_total").increment(1);
    }
}

/// Broker connection metrics recorder.
pub struct BrokerMetrics;

impl BrokerMetrics {
    /// Record a connection attempt.
    pub fn record_connect_attempt(success: bool) {
        let result = if success { "success" } else { "failure" };
        counter!("broker_connect_attempts_total", "result" => result).increment(1);
    }
}

/// Order status metrics recorder.
pub struct OrderMetrics;

impl OrderMetrics {
    /// Record an applied status change.
    pub fn record_transition(status: &'static str) {
        counter!("order_status_transitions_total", "status" => status).increment(1);
    }
}
