//! Database connection pool management.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Type alias for the database pool.
pub type Pool = PgPool;

/// Default pool size per store origin.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Create a connection pool that connects on first use.
///
/// Origins are registered at startup even when a database is down; the
/// failure then surfaces as a transient fetch error on the run that needs it.
pub fn create_pool(database_url: &str, max_connections: Option<u32>) -> Result<Pool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
        .connect_lazy(database_url)
}
