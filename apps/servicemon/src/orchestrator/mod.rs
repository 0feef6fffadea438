/// Orchestrator module - coordinates all components
///
/// The orchestrator is the core coordinator that:
/// - Builds the configured jobs, failing startup on any configuration error
/// - Opens the registry database and the series store
/// - Schedules every job and drains the event channel into the event log

#[cfg(test)]
mod tests;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::database::{EventLog, LibsqlRegistry, initialize_database};
use crate::monitoring::types::{Event, Status};
use crate::monitoring::{ChannelEmitter, JobContext, JobRunner, MonitoringScheduler};
use crate::pool::open_pool;
use crate::series::SeriesStore;

const POOL_SIZE: usize = 8;

/// Main orchestrator for the service monitor
pub struct Orchestrator {
    runners: Vec<(JobRunner, Duration)>,
    context: JobContext,
    event_rx: mpsc::UnboundedReceiver<Event>,
    event_log: EventLog,
    task_handles: Vec<JoinHandle<()>>,
}

impl Orchestrator {
    /// Create and start a new orchestrator, running until Ctrl+C
    pub async fn start(config: Config) -> Result<()> {
        let mut orchestrator = Self::new(config).await?;
        orchestrator
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
            })
            .await
    }

    /// Create a new orchestrator instance
    pub(crate) async fn new(config: Config) -> Result<Self> {
        // Nothing is opened or scheduled unless every job is valid
        let jobs = config.build_jobs().context("Invalid monitoring configuration")?;
        info!("Loaded {} service jobs", jobs.len());

        info!("Opening registry database {}", config.storage.database.display());
        let pool = open_pool(&config.storage.database, POOL_SIZE).await?;
        initialize_database(&pool).await?;

        let registry = Arc::new(LibsqlRegistry::new(pool.clone()));
        let store = Arc::new(SeriesStore::new(config.storage.rrd_dir.clone(), registry));
        info!("Series files under {}", store.base_dir().display());

        let (emitter, event_rx) = ChannelEmitter::channel();
        let context = JobContext {
            emitter: Arc::new(emitter),
            recorder: store,
            first_contact: config.monitor.first_contact,
        };

        let runners = jobs.into_iter().map(|(job, every)| (JobRunner::new(job), every)).collect();

        Ok(Self { runners, context, event_rx, event_log: EventLog::new(pool), task_handles: Vec::new() })
    }

    /// Run until `shutdown` resolves, then stop every scheduled job
    pub(crate) async fn run_until(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!("Starting service monitor...");

        let scheduler = MonitoringScheduler::new(self.context.clone());
        self.task_handles = scheduler.schedule_jobs(std::mem::take(&mut self.runners));
        info!("Scheduled {} jobs - processing events", self.task_handles.len());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(&event).await;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        for handle in self.task_handles.drain(..) {
            handle.abort();
        }

        // Events already emitted still make it to the log
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_event(&event).await;
        }

        info!("Service monitor stopped");
        Ok(())
    }

    async fn handle_event(&self, event: &Event) {
        match event.state {
            Status::Up => info!(
                job = %event.job,
                host_id = event.host_id,
                "Service recovered ({} -> up): {}",
                event.prior,
                event.diagnostic
            ),
            Status::Down => warn!(
                job = %event.job,
                host_id = event.host_id,
                "Service went down ({} -> down): {}",
                event.prior,
                event.diagnostic
            ),
        }

        if let Err(e) = self.event_log.record(event).await {
            error!(job = %event.job, "Failed to store event: {:#}", e);
        }
    }
}
