/// Monitoring engine module - probes services and tracks their state
///
/// This module is responsible for:
/// - Executing TCP banner, SSH, IMAP and HTTP probes
/// - Running the per-service state machine and reporting transitions
/// - Forwarding every sample to the series store
/// - Driving jobs on an interval when no external scheduler does
pub mod emitter;
pub mod job;
pub mod probe;
pub mod scheduler;
pub mod types;
pub mod validation;

pub use emitter::{ChannelEmitter, EventEmitter};
pub use job::{FirstContact, Job, JobContext, JobRunner, RunStatus};
pub use probe::{Probe, ProbeKind, Target};
pub use scheduler::MonitoringScheduler;
pub use types::{Event, Outcome, ServiceState, Status};
