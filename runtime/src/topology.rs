//! Broker connection lifecycle.
//!
//! [`TopologyManager`] owns the only retry loop in the reservation flow: it
//! connects, declares the service's topology, and on any failure waits a fixed
//! delay and starts over, indefinitely. Nothing downstream runs until it
//! succeeds. Shutdown is best effort: the channel and connection are closed and
//! failures are only logged.

use crate::metrics::BrokerMetrics;
use std::sync::Arc;
use std::time::Duration;
use stockbridge_core::broker::{Broker, BrokerConnector, BrokerError};
use stockbridge_core::topology::Topology;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default delay between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Establishes broker connections with the service topology declared.
pub struct TopologyManager {
    connector: Arc<dyn BrokerConnector>,
    topology: Topology,
    retry_delay: Duration,
}

impl TopologyManager {
    /// Create a manager with the default 5 second retry delay.
    #[must_use]
    pub fn new(connector: Arc<dyn BrokerConnector>, topology: Topology) -> Self {
        Self {
            connector,
            topology,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Set custom retry delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Delay between connection attempts.
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Topology declared on every connection.
    #[must_use]
    pub const fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Connect and declare the topology, retrying until it works.
    ///
    /// Returns `None` only if a shutdown signal arrives while waiting to retry.
    pub async fn establish(&self, shutdown: &mut broadcast::Receiver<()>) -> Option<Arc<dyn Broker>> {
        let endpoint = self.connector.endpoint();
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            match self.try_establish().await {
                Ok(broker) => {
                    BrokerMetrics::record_connect_attempt(true);
                    info!(
                        endpoint = %endpoint,
                        attempt,
                        exchanges = self.topology.exchanges.len(),
                        queues = self.topology.queues.len(),
                        "Broker connected and topology declared"
                    );
                    return Some(broker);
                }
                Err(e) => {
                    BrokerMetrics::record_connect_attempt(false);
                    warn!(
                        endpoint = %endpoint,
                        attempt,
                        error = %e,
                        retry_in_ms = u64::try_from(self.retry_delay.as_millis()).unwrap_or(u64::MAX),
                        "Broker unavailable, retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.recv() => {
                    info!(endpoint = %endpoint, "Shutdown requested while waiting for broker");
                    return None;
                }
                () = tokio::time::sleep(self.retry_delay) => {}
            }
        }
    }

    async fn try_establish(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        let broker = self.connector.connect().await?;
        if let Err(e) = broker.declare_topology(&self.topology).await {
            Self::shutdown(broker.as_ref()).await;
            return Err(e);
        }
        Ok(broker)
    }

    /// Close channel then connection, logging instead of failing.
    pub async fn shutdown(broker: &dyn Broker) {
        match broker.close().await {
            Ok(()) => info!("Broker connection closed"),
            Err(BrokerError::Closed) => info!("Broker connection already closed"),
            Err(e) => warn!(error = %e, "Error while closing broker connection"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use stockbridge_core::topology::BrokerNames;
    use stockbridge_testing::InMemoryBroker;

    fn manager(broker: &InMemoryBroker) -> TopologyManager {
        TopologyManager::new(
            Arc::new(broker.clone()),
            Topology::inventory(&BrokerNames::default()),
        )
        .with_retry_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn retries_until_the_broker_accepts() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(3);
        let (_tx, mut rx) = broadcast::channel(1);

        let connection = manager(&broker).establish(&mut rx).await;

        assert!(connection.is_some());
        assert_eq!(broker.connect_attempts(), 4);
        assert!(broker.has_queue("order.queue"));
    }

    #[tokio::test]
    async fn declaration_failures_close_and_retry() {
        let broker = InMemoryBroker::new();
        broker.fail_next_declares(1);
        let (_tx, mut rx) = broadcast::channel(1);

        let connection = manager(&broker).establish(&mut rx).await;

        assert!(connection.is_some());
        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.close_calls(), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_retry_loop() {
        let broker = InMemoryBroker::new();
        broker.fail_next_connects(usize::MAX);
        let (tx, mut rx) = broadcast::channel(1);
        let manager = manager(&broker).with_retry_delay(Duration::from_secs(60));

        let establish = tokio::spawn(async move { manager.establish(&mut rx).await.is_some() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();

        assert!(!establish.await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_is_best_effort() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect().await.unwrap();

        TopologyManager::shutdown(connection.as_ref()).await;
        TopologyManager::shutdown(connection.as_ref()).await;

        assert_eq!(broker.close_calls(), 2);
    }
}
