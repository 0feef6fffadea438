use anyhow::Result;
use libsql::Connection;

use crate::monitoring::types::unix_seconds;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Run database migrations
///
/// This is the single source of truth for the registry schema.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    // Create schema_migrations table first (tracks applied migrations)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Registry schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Series file registry").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Service state event history").await?;
    }

    tracing::info!("Registry migrations completed (now at version {})", SCHEMA_VERSION);
    Ok(())
}

/// Get current schema version from database
async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

/// Record that a migration was applied
async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = unix_seconds(std::time::SystemTime::now());

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: series files and their data sources
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    // host_id is NULL for files whose host has gone away (orphaned)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS series_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            step INTEGER NOT NULL,
            host_id INTEGER,
            subsystem TEXT NOT NULL,
            key TEXT NOT NULL DEFAULT '',
            value TEXT NOT NULL DEFAULT ''
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS series_datasources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_id INTEGER NOT NULL,
            name TEXT NOT NULL,
            descr TEXT NOT NULL,
            dstype TEXT NOT NULL,
            unit TEXT NOT NULL,
            FOREIGN KEY (file_id) REFERENCES series_files(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_series_files_host ON series_files(host_id, subsystem)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_series_files_key ON series_files(key, value)", ()).await?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_series_datasources_file ON series_datasources(file_id)", ()).await?;

    Ok(())
}

/// Migration v2: history of reported state changes
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS service_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job TEXT NOT NULL,
            host_id INTEGER NOT NULL,
            service_id INTEGER,
            prior_state TEXT NOT NULL,
            new_state TEXT NOT NULL,
            diagnostic TEXT NOT NULL,
            timestamp INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_service_events_job_timestamp ON service_events(job, timestamp DESC)",
        (),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let db = libsql::Builder::new_local(dir.path().join("registry.db")).build().await?;
        let conn = db.connect()?;

        run_migrations(&conn).await?;
        run_migrations(&conn).await?;

        assert_eq!(get_current_version(&conn).await?, SCHEMA_VERSION);
        let mut rows = conn.query("SELECT COUNT(*) FROM schema_migrations", ()).await?;
        let count: i64 = rows.next().await?.expect("count row").get(0)?;
        assert_eq!(count, SCHEMA_VERSION as i64);
        Ok(())
    }
}
