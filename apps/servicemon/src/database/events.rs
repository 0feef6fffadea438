use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Result, anyhow};
use libsql::params;

use crate::monitoring::types::{Event, ServiceState, Status, unix_seconds};
use crate::pool::LibsqlPool;

/// Append-only history of reported state changes
#[derive(Clone)]
pub struct EventLog {
    pool: LibsqlPool,
}

impl EventLog {
    pub fn new(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    /// Store one event
    pub async fn record(&self, event: &Event) -> Result<i64> {
        let conn = self.pool.get().await?;
        conn.execute(
            "INSERT INTO service_events (job, host_id, service_id, prior_state, new_state, diagnostic, timestamp) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                event.job.clone(),
                event.host_id,
                event.service_id,
                event.prior.to_string(),
                event.state.to_string(),
                event.diagnostic.clone(),
                unix_seconds(event.timestamp)
            ],
        )
        .await?;

        Ok(conn.last_insert_rowid())
    }

    /// Most recent events of a job, newest first
    pub async fn recent(&self, job: &str, limit: usize) -> Result<Vec<Event>> {
        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(
                "SELECT job, host_id, service_id, prior_state, new_state, diagnostic, timestamp FROM service_events WHERE job = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
                params![job, limit as i64],
            )
            .await?;

        let mut events = Vec::new();
        while let Some(row) = rows.next().await? {
            let prior: String = row.get(3)?;
            let state: String = row.get(4)?;
            let timestamp: i64 = row.get(6)?;

            events.push(Event {
                job: row.get(0)?,
                host_id: row.get(1)?,
                service_id: row.get(2)?,
                prior: match prior.as_str() {
                    "up" => ServiceState::Up,
                    "down" => ServiceState::Down,
                    _ => ServiceState::Unknown,
                },
                state: match state.as_str() {
                    "up" => Status::Up,
                    "down" => Status::Down,
                    other => return Err(anyhow!("Corrupt event row, state '{other}'")),
                },
                diagnostic: row.get(5)?,
                timestamp: UNIX_EPOCH + Duration::from_secs(timestamp.max(0) as u64),
            });
        }

        Ok(events)
    }
}
