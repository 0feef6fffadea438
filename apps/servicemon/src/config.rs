use std::collections::HashSet;
use std::time::Duration;
use std::{env, fmt, fs, path};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::monitoring::job::{FirstContact, Job};
use crate::monitoring::probe::{Probe, ProbeArgs, ProbeKind, Target};
use crate::monitoring::validation::{
    validate_address, validate_check_interval, validate_sysname, validate_timeout,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    ReadFailed {
        path: path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write config {path}: {source}")]
    WriteFailed {
        path: path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("No config directory available (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Storage {
    /// Base directory of the series files
    pub rrd_dir: path::PathBuf,
    /// libsql database holding the series registry
    pub database: path::PathBuf,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            rrd_dir: "/var/lib/servicemon/rrd".into(),
            database: "/var/lib/servicemon/registry.db".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    pub timeout_seconds: u64,
    pub interval_seconds: u64,
    pub first_contact: FirstContact,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self { timeout_seconds: 5, interval_seconds: 60, first_contact: FirstContact::Silent }
    }
}

/// One monitored service as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub host_id: i64,
    pub sysname: String,
    pub address: String,
    pub kind: String,
    pub port: Option<u16>,
    pub service_id: Option<i64>,
    pub interval_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub args: ProbeArgs,
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/servicemon/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, ConfigError> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(ConfigError::ConfigPathUnavailable);
    };

    Ok(path.join("servicemon/config.toml"))
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);
        let write_2 = write_indented(2);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Storage")?;
        write_1(f, "Series Directory", &self.storage.rrd_dir.display())?;
        write_1(f, "Registry Database", &self.storage.database.display())?;
        write_title_1(f, "Monitor")?;
        write_1(f, "Timeout (s)", &self.monitor.timeout_seconds)?;
        write_1(f, "Interval (s)", &self.monitor.interval_seconds)?;
        write_1(f, "First Contact", &format!("{:?}", self.monitor.first_contact).to_lowercase())?;
        write_title_1(f, &format!("Services ({})", self.services.len()))?;
        for service in &self.services {
            let port = service.port.map(|p| p.to_string()).unwrap_or_else(|| "default".into());
            write_2(f, &service.name, &format!("{} {}:{}", service.kind, service.address, port))?;
        }

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/servicemon/config.toml
    ///  or the specified path, with the name config.toml if one does not exist
    ///
    /// ```ignore
    /// let cfg = config::Config::from_config(None::<&path::Path>)?;
    /// println!("{}", cfg);
    /// ```
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, ConfigError> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| ConfigError::ReadFailed { path: config_path.clone(), source })?;
            Ok(toml::from_str(raw_string.as_str())?)
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            Ok(config)
        }
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), ConfigError> {
        let config_str: String = toml::to_string_pretty(self)?;
        let write_err = |source| ConfigError::WriteFailed { path: path.to_path_buf(), source };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        fs::write(path, config_str).map_err(write_err)
    }

    /// Build every configured job with its run interval.
    ///
    /// Any invalid entry fails the whole set so nothing gets scheduled on a
    /// half-valid configuration.
    pub fn build_jobs(&self) -> anyhow::Result<Vec<(Job, Duration)>> {
        validate_timeout(self.monitor.timeout_seconds).context("[monitor] timeout_seconds")?;
        validate_check_interval(self.monitor.interval_seconds).context("[monitor] interval_seconds")?;

        let mut names = HashSet::new();
        let mut jobs = Vec::with_capacity(self.services.len());
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return Err(anyhow!("Duplicate service name '{}'", service.name));
            }
            let job = service
                .build(&self.monitor)
                .with_context(|| format!("Invalid service '{}'", service.name))?;
            jobs.push(job);
        }
        Ok(jobs)
    }
}

impl ServiceConfig {
    fn build(&self, defaults: &MonitorSettings) -> anyhow::Result<(Job, Duration)> {
        validate_sysname(&self.sysname)?;
        validate_address(&self.address)?;

        let timeout = self.timeout_seconds.unwrap_or(defaults.timeout_seconds);
        let interval = self.interval_seconds.unwrap_or(defaults.interval_seconds);
        validate_timeout(timeout)?;
        validate_check_interval(interval)?;

        let kind: ProbeKind = self.kind.parse()?;
        let probe = Probe::from_args(kind, &self.args)?;
        let port = self
            .port
            .or(kind.default_port())
            .ok_or_else(|| anyhow!("A port is required for '{}' probes", kind))?;

        let job = Job::new(
            self.name.clone(),
            self.host_id,
            self.sysname.clone(),
            self.service_id,
            Target::new(self.address.clone(), port),
            probe,
            Duration::from_secs(timeout),
        );
        Ok((job, Duration::from_secs(interval)))
    }
}
