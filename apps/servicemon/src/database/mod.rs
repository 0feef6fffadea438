/// Registry database
///
/// The libsql database is the registry of record for series files and keeps
/// the history of reported state changes.

pub mod events;
pub mod migrations;
pub mod registry;

pub use events::EventLog;
pub use registry::LibsqlRegistry;

use anyhow::Result;

use crate::pool::LibsqlPool;

/// Initialize database with schema
pub async fn initialize_database(pool: &LibsqlPool) -> Result<()> {
    let conn = pool.get().await?;
    migrations::run_migrations(&conn).await
}
