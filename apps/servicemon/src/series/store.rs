use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::registry::{Ownership, Registry, RegistryError, SeriesRegistration};
use super::rrd::{SeriesFile, SeriesFileError, availability_schema};
use super::{Sample, SampleRecorder, SeriesKey};
use crate::monitoring::types::unix_seconds;

/// How far before the first sample a new file starts
const CREATE_LEAD: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SeriesError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    File(#[from] SeriesFileError),

    #[error("{action} {path} failed: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Series file task panicked: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// What reconciliation did for one identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Canonical file exists and is registered; nothing was touched
    Current(PathBuf),
    /// A fresh file was created at the canonical path and registered
    Created(PathBuf),
    /// The canonical path belongs to another series, so the identity keeps
    /// its previously registered file, recreated if it had gone missing
    Previous { path: PathBuf, created: bool },
    /// The previously registered file was moved to the canonical path
    Renamed { from: PathBuf, to: PathBuf },
    /// An unregistered file at the canonical path was taken over
    Adopted(PathBuf),
    /// The canonical path belongs to another series and the identity has no
    /// file of its own; nothing is written
    Declined { wanted: PathBuf },
}

impl Resolution {
    /// File to append to, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            Resolution::Current(path)
            | Resolution::Created(path)
            | Resolution::Previous { path, .. }
            | Resolution::Adopted(path) => Some(path),
            Resolution::Renamed { to, .. } => Some(to),
            Resolution::Declined { .. } => None,
        }
    }
}

/// Series files under one base directory, reconciled against a registry
pub struct SeriesStore {
    base_dir: PathBuf,
    registry: Arc<dyn Registry>,
    /// One lock per canonical path
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SeriesStore {
    pub fn new(base_dir: impl Into<PathBuf>, registry: Arc<dyn Registry>) -> Self {
        Self { base_dir: base_dir.into(), registry, locks: Mutex::new(HashMap::new()) }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Canonical location of the series for `key`
    pub fn wanted_path(&self, key: &SeriesKey) -> PathBuf {
        self.base_dir.join(key.file_name())
    }

    async fn lock(&self, wanted: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(wanted.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Drop the guard and forget the lock once nobody else holds or waits on it.
    async fn release(&self, wanted: &Path, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().await;
        if locks.get(wanted).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(wanted);
        }
    }

    #[cfg(test)]
    pub(crate) async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Resolve the file to update for `key`, repairing the filesystem and the
    /// registry as needed.
    pub async fn resolve(&self, key: &SeriesKey) -> Result<Resolution, SeriesError> {
        let wanted = self.wanted_path(key);
        let guard = self.lock(&wanted).await;
        let resolution = self.reconcile(key, &wanted, SystemTime::now()).await;
        self.release(&wanted, guard).await;
        resolution
    }

    /// Caller must hold the lock for `wanted`.
    async fn reconcile(
        &self,
        key: &SeriesKey,
        wanted: &Path,
        now: SystemTime,
    ) -> Result<Resolution, SeriesError> {
        let registered = self.registry.lookup_series_path(key.host_id, key.service_id).await?;
        let wanted_exists = exists(wanted).await?;

        if registered.as_deref() == Some(wanted) {
            if wanted_exists {
                return Ok(Resolution::Current(wanted.to_path_buf()));
            }
            self.create(wanted, key, now).await?;
            return Ok(Resolution::Created(wanted.to_path_buf()));
        }

        let wanted_known = self.registry.lookup_owner(wanted).await?.is_known();
        if wanted_known {
            let Some(previous) = registered else {
                warn!(
                    "Want to update {} for {}, but it is already in use by something else",
                    wanted.display(),
                    key
                );
                return Ok(Resolution::Declined { wanted: wanted.to_path_buf() });
            };
            debug!(
                "Want to rename {} to {} but the latter is already in use by something else",
                previous.display(),
                wanted.display()
            );
            let created = !exists(&previous).await?;
            if created {
                self.create(&previous, key, now).await?;
            }
            return Ok(Resolution::Previous { path: previous, created });
        }

        if let Some(previous) = registered {
            if exists(&previous).await? {
                self.rename(&previous, wanted).await?;
                return Ok(Resolution::Renamed { from: previous, to: wanted.to_path_buf() });
            }
        }

        if wanted_exists {
            info!("Adopting unregistered series file {} for {}", wanted.display(), key);
            self.verify_registration(wanted, key).await?;
            return Ok(Resolution::Adopted(wanted.to_path_buf()));
        }

        self.create(wanted, key, now).await?;
        Ok(Resolution::Created(wanted.to_path_buf()))
    }

    /// Create a series file and make sure the registry knows about it.
    async fn create(&self, path: &Path, key: &SeriesKey, now: SystemTime) -> Result<(), SeriesError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| SeriesError::Io {
                action: "creating directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let start = unix_seconds(now.checked_sub(CREATE_LEAD).unwrap_or(now)).max(0) as u64;
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || SeriesFile::create(&target, availability_schema(), start))
            .await??;
        info!("Created series file {}", path.display());

        self.verify_registration(path, key).await
    }

    /// Register `path` if the registry has never seen it, reconnect it if it
    /// was orphaned.
    async fn verify_registration(&self, path: &Path, key: &SeriesKey) -> Result<(), SeriesError> {
        match self.registry.lookup_owner(path).await? {
            Ownership::Unregistered => {
                let registration = SeriesRegistration::availability(path, key);
                self.registry.register_series(&registration).await?;
                info!("Registered series file {} for {}", path.display(), key);
            }
            Ownership::Orphaned => {
                self.registry.reconnect_series(path, key.host_id).await?;
                info!("Reconnected series file {} to host {}", path.display(), key.host_id);
            }
            Ownership::Host(owner) if owner != key.host_id => {
                warn!(
                    "Series file {} is registered to host {}, not {}; leaving it alone",
                    path.display(),
                    owner,
                    key.host_id
                );
            }
            Ownership::Host(_) => {}
        }
        Ok(())
    }

    /// Move a file on disk, then point the registry at its new home.
    ///
    /// The registry is only touched once the filesystem move has succeeded.
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), SeriesError> {
        info!("Renaming {} to {}", from.display(), to.display());
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| SeriesError::Io {
                action: "creating directory",
                path: parent.to_path_buf(),
                source,
            })?;
        }
        move_file(from, to).await.map_err(|source| SeriesError::Io {
            action: "renaming",
            path: from.to_path_buf(),
            source,
        })?;

        if let Err(e) = self.registry.rename_series(from, to).await {
            warn!("Registry rename of {} failed, moving file back: {e}", from.display());
            if let Err(undo) = move_file(to, from).await {
                warn!("Could not move {} back to {}: {undo}", to.display(), from.display());
            }
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl SampleRecorder for SeriesStore {
    async fn record(&self, key: &SeriesKey, sample: Sample) {
        let wanted = self.wanted_path(key);
        let guard = self.lock(&wanted).await;
        self.append(key, &wanted, sample).await;
        self.release(&wanted, guard).await;
    }
}

impl SeriesStore {
    /// Caller must hold the lock for `wanted`.
    async fn append(&self, key: &SeriesKey, wanted: &Path, sample: Sample) {
        let resolution = match self.reconcile(key, wanted, sample.timestamp).await {
            Ok(resolution) => resolution,
            Err(e) => {
                warn!("Could not resolve series file for {}: {e}", key);
                return;
            }
        };
        let Some(path) = resolution.path() else {
            debug!("No series file to update for {}", key);
            return;
        };

        let target = path.to_path_buf();
        let timestamp = unix_seconds(sample.timestamp).max(0) as u64;
        let values = sample.values();
        let written = tokio::task::spawn_blocking(move || {
            SeriesFile::open(&target)?.update(timestamp, &values)
        })
        .await;

        match written {
            Ok(Ok(())) => debug!("Updated {}", path.display()),
            Ok(Err(e)) => warn!("Failed to update {}: {e}", path.display()),
            Err(e) => warn!("Failed to update {}: {e}", path.display()),
        }
    }
}

/// Rename, falling back to copy and delete when `to` is on another filesystem.
async fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!("{} and {} are on different filesystems, copying", from.display(), to.display());
            if let Err(e) = tokio::fs::copy(from, to).await {
                let _ = tokio::fs::remove_file(to).await;
                return Err(e);
            }
            if let Err(e) = tokio::fs::remove_file(from).await {
                let _ = tokio::fs::remove_file(to).await;
                return Err(e);
            }
            Ok(())
        }
        other => other,
    }
}

async fn exists(path: &Path) -> Result<bool, SeriesError> {
    tokio::fs::try_exists(path).await.map_err(|source| SeriesError::Io {
        action: "checking",
        path: path.to_path_buf(),
        source,
    })
}
