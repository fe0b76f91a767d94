//! Application lifecycle management and graceful shutdown.
//!
//! [`Application`] supervises one worker per consumer. A worker owns a
//! [`TopologyManager`] and an [`EventConsumer`] and loops:
//!
//! 1. **Connect**: establish the broker connection and declare the topology,
//!    retrying with a fixed delay
//! 2. **Consume**: run the consumer until shutdown or until the delivery
//!    stream ends
//! 3. **Close**: close channel then connection, best-effort
//! 4. **Reconnect**: after a lost stream, wait the retry delay and start over
//!
//! # Graceful Shutdown
//!
//! When the shutdown signal fires (Ctrl+C or SIGTERM):
//! 1. Shutdown is broadcast to every worker
//! 2. A worker finishes the delivery it is processing, then closes its broker
//! 3. Each worker gets the shutdown timeout to finish before it is abandoned
//!
//! # Example
//!
//! ```rust,ignore
//! let app = ApplicationBuilder::new()
//!     .with_worker(manager, consumer)
//!     .with_shutdown_timeout(config.shutdown_timeout())
//!     .build();
//!
//! app.run().await;
//! ```

use std::future::Future;
use std::time::Duration;
use stockbridge_runtime::{EventConsumer, StopReason, TopologyManager};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Default time granted to each worker after the shutdown signal.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// A consumer paired with the topology manager that connects it.
struct Worker {
    manager: TopologyManager,
    consumer: EventConsumer,
}

/// How the workers ended after shutdown was requested.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers that stopped on their own
    pub stopped: usize,
    /// Workers whose task failed
    pub failed: usize,
    /// Workers still running when the timeout expired
    pub timed_out: usize,
}

impl ShutdownReport {
    /// Whether every worker stopped cleanly.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && self.timed_out == 0
    }
}

/// Builder for [`Application`].
#[must_use]
pub struct ApplicationBuilder {
    workers: Vec<Worker>,
    shutdown_timeout: Duration,
}

impl ApplicationBuilder {
    /// Start with no workers and the default shutdown timeout.
    pub const fn new() -> Self {
        Self {
            workers: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Supervise `consumer` over connections opened by `manager`.
    pub fn with_worker(mut self, manager: TopologyManager, consumer: EventConsumer) -> Self {
        self.workers.push(Worker { manager, consumer });
        self
    }

    /// Time granted to each worker after the shutdown signal.
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Finish building.
    pub fn build(self) -> Application {
        let (shutdown_tx, _) = broadcast::channel(1);
        Application {
            workers: self.workers,
            shutdown_tx,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

impl Default for ApplicationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Running application with all background workers.
pub struct Application {
    workers: Vec<Worker>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl Application {
    /// Sender that triggers shutdown when used.
    ///
    /// Useful when the application runs next to other tasks that need to
    /// stop it.
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Run until Ctrl+C or SIGTERM, then shut down gracefully.
    pub async fn run(self) -> ShutdownReport {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `signal` completes or a shutdown handle fires, then shut
    /// down gracefully.
    pub async fn run_until<F>(self, signal: F) -> ShutdownReport
    where
        F: Future<Output = ()> + Send,
    {
        info!(workers = self.workers.len(), "Starting consumers");

        let mut requested = self.shutdown_tx.subscribe();
        let handles: Vec<(String, JoinHandle<()>)> = self
            .workers
            .into_iter()
            .map(|worker| {
                let name = worker.consumer.name().to_string();
                let shutdown = self.shutdown_tx.subscribe();
                (name, tokio::spawn(supervise(worker, shutdown)))
            })
            .collect();

        tokio::select! {
            () = signal => {}
            _ = requested.recv() => {}
        }

        info!("Shutdown requested, stopping consumers");
        let _ = self.shutdown_tx.send(());

        let report = await_shutdown(handles, self.shutdown_timeout).await;
        if report.is_clean() {
            info!("Graceful shutdown complete");
        } else {
            warn!(
                failed = report.failed,
                timed_out = report.timed_out,
                "Shutdown finished with unclean workers"
            );
        }
        report
    }
}

/// Connect, consume and reconnect until shutdown.
async fn supervise(worker: Worker, mut shutdown: broadcast::Receiver<()>) {
    let Worker { manager, consumer } = worker;

    loop {
        let Some(broker) = manager.establish(&mut shutdown).await else {
            return;
        };

        let result = consumer.run(broker.clone(), &mut shutdown).await;
        TopologyManager::shutdown(broker.as_ref()).await;

        match result {
            Ok(StopReason::Shutdown) => {
                info!(consumer = %consumer.name(), "Consumer stopped");
                return;
            }
            Ok(StopReason::StreamEnded) => {
                warn!(consumer = %consumer.name(), "Broker connection lost, reconnecting");
            }
            Err(e) => {
                error!(consumer = %consumer.name(), error = %e, "Consumer failed, reconnecting");
            }
        }

        tokio::select! {
            _ = shutdown.recv() => return,
            () = tokio::time::sleep(manager.retry_delay()) => {}
        }
    }
}

/// Wait for every worker, giving each `timeout` to finish.
async fn await_shutdown(
    handles: Vec<(String, JoinHandle<()>)>,
    timeout: Duration,
) -> ShutdownReport {
    let mut report = ShutdownReport::default();

    for (name, handle) in handles {
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {
                info!(consumer = %name, "Consumer stopped gracefully");
                report.stopped += 1;
            }
            Ok(Err(e)) => {
                warn!(consumer = %name, error = %e, "Consumer task failed");
                report.failed += 1;
            }
            Err(_) => {
                warn!(consumer = %name, "Consumer shutdown timed out");
                report.timed_out += 1;
            }
        }
    }

    report
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// A handler that cannot be installed is logged and never fires.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
