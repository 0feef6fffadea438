use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use super::SeriesKey;
use super::rrd::STEP;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Registry query failed: {0}")]
    Query(#[from] libsql::Error),

    #[error("Registry connection unavailable: {0}")]
    Pool(String),

    #[error("Series file {0} is not registered")]
    UnknownSeries(PathBuf),
}

/// Who a registered series file belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The registry has never heard of the path
    Unregistered,
    /// Registered, but disconnected from any host
    Orphaned,
    Host(i64),
}

impl Ownership {
    pub fn is_known(self) -> bool {
        self != Ownership::Unregistered
    }
}

/// One recorded metric of a series file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceDescriptor {
    pub name: String,
    pub description: String,
    pub ds_type: String,
    pub unit: String,
}

/// Everything the registry records about a new series file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRegistration {
    pub path: PathBuf,
    pub step: u64,
    pub host_id: i64,
    pub subsystem: String,
    pub key: String,
    pub value: String,
    pub data_sources: Vec<DataSourceDescriptor>,
}

impl SeriesRegistration {
    /// Registration for the availability series of `key` stored at `path`.
    pub fn availability(path: &Path, key: &SeriesKey) -> Self {
        let (subsystem, rkey, value, status_descr, response_descr, status_unit) = match key.service_id {
            Some(id) => (
                "serviceping",
                "serviceid".to_string(),
                id.to_string(),
                format!("{} availability", key.handler),
                format!("{} responsetime", key.handler),
                "-100%",
            ),
            None => (
                "pping",
                String::new(),
                String::new(),
                "Packet loss".to_string(),
                "Roundtrip time".to_string(),
                "100%",
            ),
        };

        Self {
            path: path.to_path_buf(),
            step: STEP,
            host_id: key.host_id,
            subsystem: subsystem.to_string(),
            key: rkey,
            value,
            data_sources: vec![
                DataSourceDescriptor {
                    name: "RESPONSETIME".to_string(),
                    description: response_descr,
                    ds_type: "GAUGE".to_string(),
                    unit: "s".to_string(),
                },
                DataSourceDescriptor {
                    name: "STATUS".to_string(),
                    description: status_descr,
                    ds_type: "GAUGE".to_string(),
                    unit: status_unit.to_string(),
                },
            ],
        }
    }
}

/// Registry of record for series files.
///
/// When the filesystem and the registry disagree, the registry wins.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Path currently on file for a host or one of its services
    async fn lookup_series_path(
        &self,
        host_id: i64,
        service_id: Option<i64>,
    ) -> Result<Option<PathBuf>, RegistryError>;

    async fn lookup_owner(&self, path: &Path) -> Result<Ownership, RegistryError>;

    async fn register_series(&self, registration: &SeriesRegistration) -> Result<(), RegistryError>;

    /// Attach an orphaned series file to `host_id`
    async fn reconnect_series(&self, path: &Path, host_id: i64) -> Result<(), RegistryError>;

    async fn rename_series(&self, old: &Path, new: &Path) -> Result<(), RegistryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_registration() {
        let key = SeriesKey::service(7, "ludvig.ntnu.no", 54, "ssh");
        let reg = SeriesRegistration::availability(Path::new("/rrd/ludvig.ntnu.no.54.rrd"), &key);
        assert_eq!(reg.subsystem, "serviceping");
        assert_eq!((reg.key.as_str(), reg.value.as_str()), ("serviceid", "54"));
        assert_eq!(reg.step, 300);
        assert_eq!(reg.data_sources[1].description, "ssh availability");
        assert_eq!(reg.data_sources[1].unit, "-100%");
    }

    #[test]
    fn test_host_registration() {
        let key = SeriesKey::host(7, "ludvig.ntnu.no");
        let reg = SeriesRegistration::availability(Path::new("/rrd/ludvig.ntnu.no.rrd"), &key);
        assert_eq!(reg.subsystem, "pping");
        assert!(reg.key.is_empty() && reg.value.is_empty());
        assert_eq!(reg.data_sources[0].description, "Roundtrip time");
        assert_eq!(reg.data_sources[1].unit, "100%");
    }
}
