use std::path::{Path, PathBuf};

use async_trait::async_trait;
use libsql::{TransactionBehavior, params};

use crate::pool::{LibsqlManager, LibsqlPool};
use crate::series::{Ownership, Registry, RegistryError, SeriesRegistration};

/// Series file registry stored in libsql
#[derive(Clone)]
pub struct LibsqlRegistry {
    pool: LibsqlPool,
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl LibsqlRegistry {
    pub fn new(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>, RegistryError> {
        self.pool.get().await.map_err(|e| RegistryError::Pool(e.to_string()))
    }

    /// Disconnect every series file of a host, as when the host is removed
    /// from inventory. Returns the number of files orphaned.
    pub async fn orphan_host_series(&self, host_id: i64) -> Result<u64, RegistryError> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute("UPDATE series_files SET host_id = NULL WHERE host_id = ?", params![host_id])
            .await?;
        Ok(changed)
    }

    /// Names of the data sources registered for a file
    pub async fn data_sources(&self, path: &Path) -> Result<Vec<String>, RegistryError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT d.name FROM series_datasources d JOIN series_files f ON f.id = d.file_id \
                 WHERE f.path = ? ORDER BY d.id",
                params![path_text(path)],
            )
            .await?;

        let mut names = Vec::new();
        while let Some(row) = rows.next().await? {
            names.push(row.get::<String>(0)?);
        }
        Ok(names)
    }
}

#[async_trait]
impl Registry for LibsqlRegistry {
    async fn lookup_series_path(
        &self,
        host_id: i64,
        service_id: Option<i64>,
    ) -> Result<Option<PathBuf>, RegistryError> {
        let conn = self.get_conn().await?;
        let mut rows = match service_id {
            Some(id) => {
                conn.query(
                    "SELECT path FROM series_files WHERE key = 'serviceid' AND value = ? \
                     ORDER BY id DESC LIMIT 1",
                    params![id.to_string()],
                )
                .await?
            }
            None => {
                conn.query(
                    "SELECT path FROM series_files WHERE host_id = ? AND subsystem = 'pping' \
                     ORDER BY id DESC LIMIT 1",
                    params![host_id],
                )
                .await?
            }
        };

        match rows.next().await? {
            Some(row) => Ok(Some(PathBuf::from(row.get::<String>(0)?))),
            None => Ok(None),
        }
    }

    async fn lookup_owner(&self, path: &Path) -> Result<Ownership, RegistryError> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query("SELECT host_id FROM series_files WHERE path = ?", params![path_text(path)])
            .await?;

        match rows.next().await? {
            None => Ok(Ownership::Unregistered),
            Some(row) => Ok(match row.get::<Option<i64>>(0)? {
                Some(host_id) => Ownership::Host(host_id),
                None => Ownership::Orphaned,
            }),
        }
    }

    async fn register_series(&self, registration: &SeriesRegistration) -> Result<(), RegistryError> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).await?;

        tx.execute(
            "INSERT INTO series_files (path, step, host_id, subsystem, key, value) VALUES (?, ?, ?, ?, ?, ?)",
            params![
                path_text(&registration.path),
                registration.step as i64,
                registration.host_id,
                registration.subsystem.clone(),
                registration.key.clone(),
                registration.value.clone()
            ],
        )
        .await?;
        let file_id = tx.last_insert_rowid();

        for ds in &registration.data_sources {
            tx.execute(
                "INSERT INTO series_datasources (file_id, name, descr, dstype, unit) VALUES (?, ?, ?, ?, ?)",
                params![file_id, ds.name.clone(), ds.description.clone(), ds.ds_type.clone(), ds.unit.clone()],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reconnect_series(&self, path: &Path, host_id: i64) -> Result<(), RegistryError> {
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE series_files SET host_id = ? WHERE path = ?",
                params![host_id, path_text(path)],
            )
            .await?;
        if changed == 0 {
            return Err(RegistryError::UnknownSeries(path.to_path_buf()));
        }
        Ok(())
    }

    async fn rename_series(&self, old: &Path, new: &Path) -> Result<(), RegistryError> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).await?;
        let changed = tx
            .execute(
                "UPDATE series_files SET path = ? WHERE path = ?",
                params![path_text(new), path_text(old)],
            )
            .await?;
        if changed == 0 {
            tx.rollback().await?;
            return Err(RegistryError::UnknownSeries(old.to_path_buf()));
        }
        tx.commit().await?;
        Ok(())
    }
}
