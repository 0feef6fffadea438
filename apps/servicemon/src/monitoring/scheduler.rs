use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info};

use super::job::{JobContext, JobRunner, RunStatus};

/// Interval driver standing in for an external scheduler.
///
/// Each job gets its own task. A tick that fires while the previous run of
/// the same job is still going is skipped, never overlapped.
pub struct MonitoringScheduler {
    context: JobContext,
}

impl MonitoringScheduler {
    pub fn new(context: JobContext) -> Self {
        Self { context }
    }

    /// Schedule a single job for periodic runs
    pub fn schedule_job(&self, runner: JobRunner, every: Duration) -> JoinHandle<()> {
        let context = self.context.clone();

        tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(job = runner.name(), "Scheduled every {}s", every.as_secs());

            loop {
                timer.tick().await;

                let runner = runner.clone();
                let context = context.clone();
                // Detached so a slow probe cannot hold up the next tick
                tokio::spawn(async move {
                    match runner.try_run(&context).await {
                        RunStatus::Completed(outcome) => {
                            debug!(job = runner.name(), "Run finished: {}", outcome.status)
                        }
                        RunStatus::Skipped => {
                            debug!(job = runner.name(), "Tick skipped, previous run in flight")
                        }
                    }
                });
            }
        })
    }

    /// Schedule multiple jobs
    pub fn schedule_jobs(&self, jobs: Vec<(JobRunner, Duration)>) -> Vec<JoinHandle<()>> {
        jobs.into_iter().map(|(runner, every)| self.schedule_job(runner, every)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::emitter::ChannelEmitter;
    use crate::monitoring::job::{FirstContact, Job};
    use crate::monitoring::probe::{Probe, Target};
    use crate::series::{Sample, SampleRecorder, SeriesKey};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct CountingRecorder(AtomicUsize);

    #[async_trait]
    impl SampleRecorder for CountingRecorder {
        async fn record(&self, _key: &SeriesKey, _sample: Sample) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_scheduler_runs_repeatedly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (emitter, _rx) = ChannelEmitter::channel();
        let recorder = Arc::new(CountingRecorder::default());
        let scheduler = MonitoringScheduler::new(JobContext {
            emitter: Arc::new(emitter),
            recorder: recorder.clone(),
            first_contact: FirstContact::Silent,
        });

        let job = Job::new(
            "closed-port",
            1,
            "localhost",
            Some(1),
            Target::new("127.0.0.1", port),
            Probe::TcpBanner,
            Duration::from_millis(200),
        );
        let handle = scheduler.schedule_job(JobRunner::new(job), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(400)).await;
        handle.abort();

        assert!(recorder.0.load(Ordering::SeqCst) >= 2);
    }
}
