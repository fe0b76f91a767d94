//! `PostgreSQL` adapters for Stockbridge.
//!
//! - [`PostgresLedger`]: the stock ledger, with row locks taken by
//!   `SELECT ... FOR UPDATE` inside one transaction per reservation
//! - [`PostgresOrderStatusStore`]: order statuses for the order side
//!
//! Both share one connection pool. [`migrate`] creates the `products_stock` and
//! `orders_status` tables.
//!
//! # Example
//!
//! ```ignore
//! use stockbridge_postgres::{PostgresLedger, connect, migrate};
//!
//! let pool = connect("postgres://localhost/inventory_db", 10).await?;
//! migrate(&pool).await?;
//! let ledger = PostgresLedger::new(pool).with_lock_timeout(Duration::from_secs(5));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod ledger;
mod orders;

pub use ledger::{DEFAULT_LOCK_TIMEOUT, PostgresLedger};
pub use orders::PostgresOrderStatusStore;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// SQLSTATE `lock_not_available`, raised when `lock_timeout` expires.
pub(crate) const LOCK_NOT_AVAILABLE: &str = "55P03";

/// SQLSTATE `unique_violation`.
pub(crate) const UNIQUE_VIOLATION: &str = "23505";

/// Open a connection pool.
///
/// # Errors
///
/// Returns the driver error if no connection can be established.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    tracing::info!(max_connections, "Database pool ready");
    Ok(pool)
}

/// Apply the bundled migrations.
///
/// # Errors
///
/// Returns the migration error if any migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

/// SQLSTATE of a database error, if the error came from the server.
pub(crate) fn sqlstate(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db) => db.code().map(|code| code.into_owned()),
        _ => None,
    }
}
