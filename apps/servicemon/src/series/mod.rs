//! Time-series storage for availability metrics.
//!
//! Every monitored host or service owns one series file under a base
//! directory. The file's canonical name follows the host's current sysname,
//! while the [`Registry`] remembers where the file was last put; the
//! [`SeriesStore`] reconciles the two before each sample is appended.

pub mod registry;
pub mod rrd;
mod store;


use std::fmt;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use crate::monitoring::types::Status;

pub use registry::{DataSourceDescriptor, Ownership, Registry, RegistryError, SeriesRegistration};
pub use store::{Resolution, SeriesError, SeriesStore};

/// Identity of one series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    /// Stable id of the host in the registry
    pub host_id: i64,
    /// Current name of the host, which drives the file name
    pub sysname: String,
    pub service_id: Option<i64>,
    /// Probe kind, used to describe registered data sources
    pub handler: String,
}

impl SeriesKey {
    pub fn host(host_id: i64, sysname: impl Into<String>) -> Self {
        Self { host_id, sysname: sysname.into(), service_id: None, handler: String::new() }
    }

    pub fn service(host_id: i64, sysname: impl Into<String>, service_id: i64, handler: impl Into<String>) -> Self {
        Self { host_id, sysname: sysname.into(), service_id: Some(service_id), handler: handler.into() }
    }

    /// `<sysname>.rrd` or `<sysname>.<service id>.rrd`
    pub fn file_name(&self) -> String {
        match self.service_id {
            Some(id) => format!("{}.{}.rrd", self.sysname, id),
            None => format!("{}.rrd", self.sysname),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.service_id {
            Some(id) => write!(f, "{}:{}", self.sysname, id),
            None => write!(f, "{}", self.sysname),
        }
    }
}

/// One availability measurement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: SystemTime,
    pub status: Status,
    pub response_time: Option<Duration>,
}

impl Sample {
    /// Values in schema order: STATUS, RESPONSETIME
    pub fn values(&self) -> [Option<f64>; 2] {
        [Some(f64::from(self.status.sample_bit())), self.response_time.map(|rt| rt.as_secs_f64())]
    }
}

/// Destination for the raw samples produced by every job run.
///
/// Recording never fails from the caller's point of view; implementations
/// log and drop samples they cannot store.
#[async_trait]
pub trait SampleRecorder: Send + Sync {
    async fn record(&self, key: &SeriesKey, sample: Sample);
}
