use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::emitter::EventEmitter;
use super::probe::{Probe, Target};
use super::types::{Event, Observation, Outcome, ServiceState, Status};
use crate::series::{Sample, SampleRecorder, SeriesKey};

/// Whether the very first observation of a job is reported as an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirstContact {
    /// Record the state without an event
    #[default]
    Silent,
    /// Report the first observed state like any other change
    Report,
}

/// Result of feeding one observation into the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: ServiceState,
    pub emit: bool,
}

/// Pure transition rule: next state and whether the change is reported.
pub fn transition(prior: ServiceState, observed: Status, first_contact: FirstContact) -> Transition {
    let next = ServiceState::from(observed);
    let emit = match prior {
        ServiceState::Unknown => first_contact == FirstContact::Report,
        _ => prior != next,
    };
    Transition { next, emit }
}

/// One monitored service
#[derive(Debug, Clone)]
pub struct Job {
    name: String,
    host_id: i64,
    sysname: String,
    service_id: Option<i64>,
    target: Target,
    probe: Probe,
    timeout: Duration,
    state: ServiceState,
    version: Option<String>,
    last_run: Option<SystemTime>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        host_id: i64,
        sysname: impl Into<String>,
        service_id: Option<i64>,
        target: Target,
        probe: Probe,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            host_id,
            sysname: sysname.into(),
            service_id,
            target,
            probe,
            timeout,
            state: ServiceState::Unknown,
            version: None,
            last_run: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Banner or version reported by the last successful probe
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn last_run(&self) -> Option<SystemTime> {
        self.last_run
    }

    /// Hosts renamed in inventory keep their id; the series follows the name
    pub fn set_sysname(&mut self, sysname: impl Into<String>) {
        self.sysname = sysname.into();
    }

    pub fn series_key(&self) -> SeriesKey {
        match self.service_id {
            Some(id) => SeriesKey::service(self.host_id, self.sysname.clone(), id, self.probe.kind().as_str()),
            None => SeriesKey::host(self.host_id, self.sysname.clone()),
        }
    }

    /// Probe the service, report any transition, then record the sample.
    pub async fn run(&mut self, ctx: &JobContext) -> Outcome {
        let observation = self.probe.observe(&self.target, self.timeout).await;
        self.apply(observation, ctx).await
    }

    /// Feed an observation through the state machine and the recorder.
    ///
    /// The event, if any, is emitted before the stored state changes.
    pub async fn apply(&mut self, observation: Observation, ctx: &JobContext) -> Outcome {
        let Observation { ref outcome, timestamp, .. } = observation;
        let step = transition(self.state, outcome.status, ctx.first_contact);

        if step.emit {
            info!(
                job = %self.name,
                target = %self.target,
                "State changed {} -> {}: {}",
                self.state,
                outcome.status,
                outcome.diagnostic
            );
            ctx.emitter.emit(Event {
                job: self.name.clone(),
                host_id: self.host_id,
                service_id: self.service_id,
                prior: self.state,
                state: outcome.status,
                diagnostic: outcome.diagnostic.clone(),
                timestamp,
            });
        } else {
            debug!(job = %self.name, "Still {}: {}", step.next, outcome.diagnostic);
        }
        self.state = step.next;
        if outcome.is_up() {
            self.version = Some(outcome.diagnostic.clone());
        }

        let sample = Sample { timestamp, status: outcome.status, response_time: observation.response_time() };
        ctx.recorder.record(&self.series_key(), sample).await;
        self.last_run = Some(timestamp);

        observation.outcome
    }
}

/// Collaborators shared by every job
#[derive(Clone)]
pub struct JobContext {
    pub emitter: Arc<dyn EventEmitter>,
    pub recorder: Arc<dyn SampleRecorder>,
    pub first_contact: FirstContact,
}

/// What happened to a scheduled run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Completed(Outcome),
    /// The previous run of the same job was still in flight
    Skipped,
}

/// Serializes runs of one job
#[derive(Clone)]
pub struct JobRunner {
    job: Arc<Mutex<Job>>,
    name: Arc<str>,
}

impl JobRunner {
    pub fn new(job: Job) -> Self {
        let name = Arc::from(job.name());
        Self { job: Arc::new(Mutex::new(job)), name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run now unless a run of this job is already going on.
    pub async fn try_run(&self, ctx: &JobContext) -> RunStatus {
        let Ok(mut job) = self.job.try_lock() else {
            debug!(job = %self.name, "Previous run still in flight, skipping");
            return RunStatus::Skipped;
        };
        RunStatus::Completed(job.run(ctx).await)
    }

    /// Snapshot of the job between runs
    pub async fn snapshot(&self) -> Job {
        self.job.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::emitter::MemoryEmitter;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// Keeps samples in memory
    #[derive(Default)]
    struct MemoryRecorder {
        samples: StdMutex<Vec<(SeriesKey, Sample)>>,
    }

    #[async_trait]
    impl SampleRecorder for MemoryRecorder {
        async fn record(&self, key: &SeriesKey, sample: Sample) {
            self.samples.lock().unwrap().push((key.clone(), sample));
        }
    }

    fn context(first_contact: FirstContact) -> (JobContext, Arc<MemoryEmitter>, Arc<MemoryRecorder>) {
        let emitter = Arc::new(MemoryEmitter::default());
        let recorder = Arc::new(MemoryRecorder::default());
        let ctx = JobContext { emitter: emitter.clone(), recorder: recorder.clone(), first_contact };
        (ctx, emitter, recorder)
    }

    fn job() -> Job {
        Job::new(
            "ludvig-ssh",
            7,
            "ludvig.example.org",
            Some(54),
            Target::new("127.0.0.1", 22),
            Probe::Ssh,
            Duration::from_secs(1),
        )
    }

    fn observed(status: Status) -> Observation {
        let outcome = match status {
            Status::Up => Outcome::up("SSH-2.0-OpenSSH_7.4"),
            Status::Down => Outcome::down("connection refused"),
        };
        Observation { outcome, elapsed: Duration::from_millis(15), timestamp: SystemTime::now() }
    }

    #[test]
    fn test_transition_rule() {
        use ServiceState::{Down, Unknown, Up};

        let silent = FirstContact::Silent;
        assert_eq!(transition(Unknown, Status::Up, silent), Transition { next: Up, emit: false });
        assert_eq!(transition(Unknown, Status::Down, silent), Transition { next: Down, emit: false });
        assert_eq!(transition(Up, Status::Up, silent), Transition { next: Up, emit: false });
        assert_eq!(transition(Up, Status::Down, silent), Transition { next: Down, emit: true });
        assert_eq!(transition(Down, Status::Up, silent), Transition { next: Up, emit: true });
        assert_eq!(transition(Down, Status::Down, silent), Transition { next: Down, emit: false });

        let report = FirstContact::Report;
        assert_eq!(transition(Unknown, Status::Down, report), Transition { next: Down, emit: true });
        assert_eq!(transition(Up, Status::Up, report), Transition { next: Up, emit: false });
    }

    #[test]
    fn test_events_match_changes_for_any_sequence() {
        // Every sequence of five outcomes
        for mask in 0u32..32 {
            let sequence: Vec<Status> =
                (0..5).map(|i| if mask & (1 << i) != 0 { Status::Down } else { Status::Up }).collect();

            let mut state = ServiceState::Unknown;
            let mut emitted = 0;
            for status in &sequence {
                let step = transition(state, *status, FirstContact::Silent);
                if step.emit {
                    emitted += 1;
                }
                state = step.next;
            }

            let changes = sequence.windows(2).filter(|w| w[0] != w[1]).count();
            assert_eq!(emitted, changes, "sequence {sequence:?}");
        }
    }

    #[tokio::test]
    async fn test_apply_emits_before_overwriting_state() {
        let (ctx, emitter, recorder) = context(FirstContact::Silent);
        let mut job = job();

        job.apply(observed(Status::Up), &ctx).await;
        assert_eq!(job.state(), ServiceState::Up);
        assert!(emitter.events().is_empty());

        job.apply(observed(Status::Up), &ctx).await;
        job.apply(observed(Status::Down), &ctx).await;
        let events = emitter.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].prior, ServiceState::Up);
        assert_eq!(events[0].state, Status::Down);
        assert_eq!(events[0].diagnostic, "connection refused");
        assert_eq!(events[0].service_id, Some(54));
        assert_eq!(job.state(), ServiceState::Down);
        assert_eq!(job.version(), Some("SSH-2.0-OpenSSH_7.4"));

        // A sample per run, transition or not
        let samples = recorder.samples.lock().unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].0.file_name(), "ludvig.example.org.54.rrd");
        assert_eq!(samples[0].1.response_time, Some(Duration::from_millis(15)));
        assert_eq!(samples[2].1.status, Status::Down);
        assert_eq!(samples[2].1.response_time, None);
        assert_eq!(job.last_run(), Some(samples[2].1.timestamp));
    }

    #[test]
    fn test_renamed_host_moves_series_key() {
        let mut job = job();
        job.set_sysname("bragi.example.org");

        let key = job.series_key();
        assert_eq!(key.host_id, 7);
        assert_eq!(key.handler, "ssh");
        assert_eq!(key.file_name(), "bragi.example.org.54.rrd");
    }

    #[tokio::test]
    async fn test_first_contact_can_be_reported() {
        let (ctx, emitter, _) = context(FirstContact::Report);
        let mut job = job();

        job.apply(observed(Status::Down), &ctx).await;
        let events = emitter.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].prior, ServiceState::Unknown);
    }

    #[tokio::test]
    async fn test_overlapping_run_is_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            socket.write_all(b"SSH-2.0-OpenSSH_7.4\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (ctx, _, recorder) = context(FirstContact::Silent);
        let runner = JobRunner::new(Job::new(
            "slow-ssh",
            1,
            "slow.example",
            Some(1),
            Target::new("127.0.0.1", port),
            Probe::Ssh,
            Duration::from_secs(5),
        ));

        let first = {
            let runner = runner.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { runner.try_run(&ctx).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(runner.try_run(&ctx).await, RunStatus::Skipped);
        let RunStatus::Completed(outcome) = first.await.unwrap() else {
            panic!("first run should complete");
        };
        assert_eq!(outcome.diagnostic, "SSH-2.0-OpenSSH_7.4");
        assert_eq!(recorder.samples.lock().unwrap().len(), 1);
        assert_eq!(runner.snapshot().await.state(), ServiceState::Up);
    }
}
