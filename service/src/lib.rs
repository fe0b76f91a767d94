//! # Stockbridge Service
//!
//! Composition root of the inventory service: configuration, worker wiring
//! and the supervised lifecycle shared by the `inventory-service` and `demo`
//! binaries.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod lifecycle;
pub mod wiring;

pub use config::Config;
pub use lifecycle::{Application, ApplicationBuilder, ShutdownReport, shutdown_signal};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the `fmt` subscriber, filtered by `RUST_LOG` or `default_filter`.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
