//! Lookup-table resolution for the closed enumerations.

use exn::{OptionExt, ResultExt};
use mediabackups_media::{BackupStatus, ContainerType, FileStatus, FileType, WikiType};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::str::FromStr;

use crate::error::{ErrorKind, Result};

/// Bidirectional mapping between one enumeration and its lookup table ids.
#[derive(Debug, Clone)]
pub struct Lookup<T> {
    table: &'static str,
    ids: HashMap<T, i64>,
    values: HashMap<i64, T>,
}

impl<T> Lookup<T>
where
    T: Copy + Eq + Hash + Display + FromStr,
{
    async fn load(pool: &SqlitePool, table: &'static str, expected: &[T]) -> Result<Self> {
        let sql = format!("SELECT id, name FROM {table}");
        let rows: Vec<(i64, String)> = sqlx::query_as(&sql)
            .fetch_all(pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let mut ids = HashMap::with_capacity(rows.len());
        let mut values = HashMap::with_capacity(rows.len());
        for (id, name) in rows {
            // Rows added by operators that this build doesn't know about
            // are never written, and never read back into a typed value.
            let Ok(value) = name.parse::<T>() else {
                tracing::debug!(table, name = %name, "ignoring unknown lookup value");
                continue;
            };
            ids.insert(value, id);
            values.insert(id, value);
        }
        if let Some(missing) = expected.iter().find(|value| !ids.contains_key(value)) {
            exn::bail!(ErrorKind::MissingLookup {
                table,
                value: missing.to_string(),
            });
        }
        Ok(Self { table, ids, values })
    }

    pub fn id(&self, value: T) -> Result<i64> {
        self.ids.get(&value).copied().ok_or_raise(|| ErrorKind::MissingLookup {
            table: self.table,
            value: value.to_string(),
        })
    }

    pub fn value(&self, id: i64) -> Result<T> {
        self.values.get(&id).copied().ok_or_raise(|| ErrorKind::InvalidData(self.table))
    }
}

/// Every lookup table, resolved once per process and passed explicitly to
/// whatever needs to translate between ids and enumerations.
#[derive(Debug, Clone)]
pub struct Lookups {
    pub wiki_types: Lookup<WikiType>,
    pub file_types: Lookup<FileType>,
    pub file_status: Lookup<FileStatus>,
    pub backup_status: Lookup<BackupStatus>,
    pub container_types: Lookup<ContainerType>,
}

impl Lookups {
    #[tracing::instrument("resolving lookup tables", skip_all)]
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        Ok(Self {
            wiki_types: Lookup::load(pool, "wiki_types", WikiType::ALL).await?,
            file_types: Lookup::load(pool, "file_types", FileType::ALL).await?,
            file_status: Lookup::load(pool, "file_status", FileStatus::ALL).await?,
            backup_status: Lookup::load(pool, "backup_status", BackupStatus::ALL).await?,
            container_types: Lookup::load(pool, "container_types", ContainerType::ALL).await?,
        })
    }
}
