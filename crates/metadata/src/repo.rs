//! Transactional operations on the metadata store.
//!
//! Every mutation of a file snapshot is bundled with the history row that
//! records it: both are written in one transaction or not at all. Snapshots
//! carry a revision number; writes compare it against the stored value so a
//! concurrent writer is detected instead of silently overwritten.

use exn::{OptionExt, ResultExt};
use mediabackups_media::{
    BackupKey, BackupRecord, BackupStatus, ContainerType, FileKey, FileRecord, LiveFile, Location, WikiType,
};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::sync::Arc;
use time::UtcDateTime;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::models::{
    self, BackupRow, ChangeKind, FileFilter, FileRow, HistoryEntry, HistoryRow, InsertOutcome, LocationRow,
};
use crate::{Database, Lookups};

const SELECT_FILES: &str = include_str!("../queries/select_files.sql");

fn size(file: &LiveFile) -> Result<Option<i64>> {
    file.size.map(i64::try_from).transpose().or_raise(|| ErrorKind::InvalidData("file size"))
}

async fn wiki_id(conn: &mut SqliteConnection, wiki: &str) -> Result<i64> {
    let row: Option<(i64, i64)> = sqlx::query_as(include_str!("../queries/get_wiki.sql"))
        .bind(wiki)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    row.map(|(id, _)| id).ok_or_raise(|| ErrorKind::NotFound(format!("wiki {wiki}")))
}

async fn location_id(conn: &mut SqliteConnection, location: &str) -> Result<i64> {
    let id: Option<i64> = sqlx::query_scalar(include_str!("../queries/get_location_id.sql"))
        .bind(location)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    id.ok_or_raise(|| ErrorKind::NotFound(format!("location {location}")))
}

/// How many of the `required` locations hold a confirmed copy of the content.
async fn present_at(conn: &mut SqliteConnection, wiki: &str, sha256: Option<&str>, required: &[i64]) -> Result<usize> {
    let Some(sha256) = sha256 else {
        return Ok(0);
    };
    let locations: Vec<i64> = sqlx::query_scalar(include_str!("../queries/backup_locations_for_content.sql"))
        .bind(wiki)
        .bind(sha256)
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(locations.iter().filter(|id| required.contains(id)).count())
}

/// Repository over the whole metadata schema.
///
/// Cheap to clone: the pool and the resolved lookup tables are shared.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
    lookups: Arc<Lookups>,
}

impl Repository {
    /// Open a repository, resolving the lookup tables once.
    pub async fn open(db: &Database) -> Result<Self> {
        let lookups = Lookups::load(db.pool()).await?;
        Ok(Self {
            pool: db.pool().clone(),
            lookups: Arc::new(lookups),
        })
    }

    pub fn lookups(&self) -> &Lookups {
        &self.lookups
    }

    // =========================================================================
    // Wikis & Locations
    // =========================================================================

    /// Register a wiki. An existing wiki keeps its recorded type.
    pub async fn ensure_wiki(&self, wiki: &str, wiki_type: WikiType) -> Result<()> {
        sqlx::query(include_str!("../queries/ensure_wiki.sql"))
            .bind(wiki)
            .bind(self.lookups.wiki_types.id(wiki_type)?)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn wiki_type(&self, wiki: &str) -> Result<Option<WikiType>> {
        let row: Option<(i64, i64)> = sqlx::query_as(include_str!("../queries/get_wiki.sql"))
            .bind(wiki)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        row.map(|(_, wiki_type)| self.lookups.wiki_types.value(wiki_type)).transpose()
    }

    pub async fn list_wikis(&self) -> Result<Vec<String>> {
        sqlx::query_scalar(include_str!("../queries/list_wikis.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Register a backup location, or update its endpoint and write flag.
    ///
    /// Disabling writes never touches the backup rows already recorded
    /// there.
    pub async fn ensure_location(&self, name: &str, endpoint: Option<&str>, writes_enabled: bool) -> Result<Location> {
        let row: LocationRow = sqlx::query_as(include_str!("../queries/upsert_location.sql"))
            .bind(name)
            .bind(endpoint)
            .bind(writes_enabled)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.into())
    }

    pub async fn locations(&self) -> Result<Vec<Location>> {
        let rows: Vec<LocationRow> = sqlx::query_as(include_str!("../queries/list_locations.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(rows.into_iter().map(Location::from).collect())
    }

    async fn container_id(
        &self,
        conn: &mut SqliteConnection,
        wiki_id: i64,
        container: &str,
        container_type: ContainerType,
    ) -> Result<i64> {
        sqlx::query(include_str!("../queries/ensure_container.sql"))
            .bind(container)
            .bind(wiki_id)
            .bind(self.lookups.container_types.id(container_type)?)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query_scalar(include_str!("../queries/get_container_id.sql"))
            .bind(container)
            .fetch_one(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)
    }

    // =========================================================================
    // Files
    // =========================================================================

    pub async fn get_file(&self, wiki: &str, key: &FileKey) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(concat!(
            include_str!("../queries/select_files.sql"),
            " WHERE w.name = ? AND c.name = ? AND f.storage_path = ?"
        ))
        .bind(wiki)
        .bind(&key.container)
        .bind(&key.path)
        .fetch_optional(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        row.map(|row| row.decode(&self.lookups)).transpose()
    }

    pub async fn get_file_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        self.load_file(&mut conn, id).await
    }

    async fn load_file(&self, conn: &mut SqliteConnection, id: i64) -> Result<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as(concat!(
            include_str!("../queries/select_files.sql"),
            " WHERE f.id = ?"
        ))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
        row.map(|row| row.decode(&self.lookups)).transpose()
    }

    /// Every tracked file of a wiki, including those the source deleted.
    pub async fn list_files(&self, wiki: &str) -> Result<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as(concat!(
            include_str!("../queries/select_files.sql"),
            " WHERE w.name = ? ORDER BY f.id"
        ))
        .bind(wiki)
        .fetch_all(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|row| row.decode(&self.lookups)).collect()
    }

    /// Restrict `query` to files that still lack a copy somewhere: those in
    /// any of the `outstanding` states, and `complete` ones missing a row at
    /// one of the `required` locations (enabled after they were backed up).
    fn push_needs_backup(
        &self,
        query: &mut QueryBuilder<'_, Sqlite>,
        outstanding: &[BackupStatus],
        required: &[i64],
    ) -> Result<()> {
        query.push(" AND (0");
        if !outstanding.is_empty() {
            query.push(" OR f.backup_status IN (");
            let mut ids = query.separated(", ");
            for status in outstanding {
                ids.push_bind(self.lookups.backup_status.id(*status)?);
            }
            ids.push_unseparated(")");
        }
        if !required.is_empty() {
            query.push(" OR (f.backup_status = ");
            query.push_bind(self.lookups.backup_status.id(BackupStatus::Complete)?);
            query.push(" AND EXISTS (SELECT 1 FROM locations l WHERE l.id IN (");
            let mut ids = query.separated(", ");
            for location in required {
                ids.push_bind(*location);
            }
            ids.push_unseparated(")");
            query.push(
                " AND NOT EXISTS (SELECT 1 FROM backups b \
                 WHERE b.location = l.id AND b.wiki = f.wiki AND b.sha256 = f.sha256)))",
            );
        }
        query.push(")");
        Ok(())
    }

    /// Next page of a wiki's files needing a backup run, ordered by id.
    ///
    /// The stored status alone is not trusted: a `complete` file is picked
    /// again when one of the `required` locations holds no copy of its
    /// content.
    pub async fn files_needing_backup(
        &self,
        wiki: &str,
        outstanding: &[BackupStatus],
        required: &[i64],
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).or_raise(|| ErrorKind::InvalidData("limit"))?;
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_FILES);
        query.push(" WHERE w.name = ").push_bind(wiki.to_string());
        query.push(" AND f.id > ").push_bind(after_id);
        self.push_needs_backup(&mut query, outstanding, required)?;
        query.push(" ORDER BY f.id LIMIT ").push_bind(limit);
        let rows: Vec<FileRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|row| row.decode(&self.lookups)).collect()
    }

    /// Like [`files_needing_backup`](Self::files_needing_backup), among the
    /// given files of any wiki.
    pub async fn files_needing_backup_among(
        &self,
        ids: &[i64],
        outstanding: &[BackupStatus],
        required: &[i64],
    ) -> Result<Vec<FileRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_FILES);
        query.push(" WHERE f.id IN (");
        let mut list = query.separated(", ");
        for id in ids {
            list.push_bind(*id);
        }
        list.push_unseparated(")");
        self.push_needs_backup(&mut query, outstanding, required)?;
        query.push(" ORDER BY f.id");
        let rows: Vec<FileRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|row| row.decode(&self.lookups)).collect()
    }

    /// Files matching a filter, optionally restricted to one wiki.
    pub async fn files_matching(&self, wiki: Option<&str>, filter: &FileFilter) -> Result<Vec<FileRecord>> {
        let mut query = QueryBuilder::<Sqlite>::new(SELECT_FILES);
        query.push(" WHERE 1 = 1");
        if let Some(wiki) = wiki {
            query.push(" AND w.name = ").push_bind(wiki.to_string());
        }
        match filter {
            FileFilter::Ids(ids) if ids.is_empty() => return Ok(Vec::new()),
            FileFilter::Ids(ids) => {
                query.push(" AND f.id IN (");
                let mut list = query.separated(", ");
                for id in ids {
                    list.push_bind(*id);
                }
                list.push_unseparated(")");
            },
            FileFilter::Title(title) => {
                query.push(" AND f.upload_name = ").push_bind(title.clone());
            },
            FileFilter::Sha1(sha1) => {
                query.push(" AND f.sha1 = ").push_bind(sha1.to_ascii_lowercase());
            },
            FileFilter::Sha256(sha256) => {
                query.push(" AND f.sha256 = ").push_bind(sha256.to_ascii_lowercase());
            },
            FileFilter::SourcePath { container, path } => {
                query.push(" AND c.name = ").push_bind(container.clone());
                query.push(" AND f.storage_path = ").push_bind(path.clone());
            },
            FileFilter::UploadedBetween(from, to) => {
                query.push(" AND f.upload_timestamp BETWEEN ").push_bind(from.unix_timestamp());
                query.push(" AND ").push_bind(to.unix_timestamp());
            },
            FileFilter::ArchivedBetween(from, to) => {
                query.push(" AND f.archived_timestamp BETWEEN ").push_bind(from.unix_timestamp());
                query.push(" AND ").push_bind(to.unix_timestamp());
            },
            FileFilter::DeletedBetween(from, to) => {
                query.push(" AND f.deleted_timestamp BETWEEN ").push_bind(from.unix_timestamp());
                query.push(" AND ").push_bind(to.unix_timestamp());
            },
            FileFilter::DeletedBefore(before) => {
                query.push(" AND f.deleted_timestamp < ").push_bind(before.unix_timestamp());
            },
        }
        query.push(" ORDER BY f.id");
        let rows: Vec<FileRow> = query
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|row| row.decode(&self.lookups)).collect()
    }

    /// Start tracking a file. The new snapshot waits for a backup run
    /// (`pending`), and its first history row is written alongside it.
    ///
    /// Raises [`ErrorKind::Conflict`] if another writer tracked the same
    /// file first.
    #[instrument(skip(self, file, observed_at), fields(container = %file.container, path = %file.path))]
    pub async fn insert_file(
        &self,
        wiki: &str,
        file: &LiveFile,
        observed_at: Option<UtcDateTime>,
    ) -> Result<FileRecord> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let wiki_id = wiki_id(&mut tx, wiki).await?;
        let container_id = self
            .container_id(&mut tx, wiki_id, &file.container, ContainerType::for_status(file.status))
            .await?;
        let result = sqlx::query(include_str!("../queries/insert_file.sql"))
            .bind(wiki_id)
            .bind(file.upload_name.as_deref())
            .bind(container_id)
            .bind(&file.path)
            .bind(self.lookups.file_types.id(file.file_type)?)
            .bind(self.lookups.file_status.id(file.status)?)
            .bind(file.sha1.as_deref())
            .bind(file.md5.as_deref())
            .bind(None::<&str>)
            .bind(size(file)?)
            .bind(models::timestamp(file.uploaded_at))
            .bind(models::timestamp(file.archived_at))
            .bind(models::timestamp(file.deleted_at))
            .bind(self.lookups.backup_status.id(BackupStatus::Pending)?)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::Conflict(format!("{wiki}:{}/{}", file.container, file.path)));
        }
        let record = FileRecord {
            id: result.last_insert_rowid(),
            wiki: wiki.to_string(),
            revision: 1,
            file: file.clone(),
            sha256: None,
            backup_status: BackupStatus::Pending,
        };
        self.append_history(&mut tx, &record, container_id, ChangeKind::Created, None, observed_at)
            .await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(record)
    }

    /// Replace the snapshot of `next.id` with `next` and append the matching
    /// history row.
    ///
    /// `next.revision` must be the revision that was read; if the stored
    /// revision moved on in the meantime nothing is written and
    /// [`ErrorKind::Conflict`] is raised. Returns the snapshot with its new
    /// revision.
    #[instrument(skip(self, next, observed_at), fields(file = next.id, revision = next.revision))]
    pub async fn update_file(
        &self,
        next: &FileRecord,
        kind: ChangeKind,
        observed_at: Option<UtcDateTime>,
    ) -> Result<FileRecord> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let record = self.write_snapshot(&mut tx, next, kind, None, observed_at).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(record)
    }

    async fn write_snapshot(
        &self,
        conn: &mut SqliteConnection,
        next: &FileRecord,
        kind: ChangeKind,
        location_id: Option<i64>,
        observed_at: Option<UtcDateTime>,
    ) -> Result<FileRecord> {
        let wiki_id = wiki_id(conn, &next.wiki).await?;
        let container_id = self
            .container_id(conn, wiki_id, &next.container, ContainerType::for_status(next.status))
            .await?;
        let result = sqlx::query(include_str!("../queries/update_file.sql"))
            .bind(next.upload_name.as_deref())
            .bind(container_id)
            .bind(&next.path)
            .bind(self.lookups.file_types.id(next.file_type)?)
            .bind(self.lookups.file_status.id(next.status)?)
            .bind(next.sha1.as_deref())
            .bind(next.md5.as_deref())
            .bind(next.sha256.as_deref())
            .bind(size(next)?)
            .bind(models::timestamp(next.uploaded_at))
            .bind(models::timestamp(next.archived_at))
            .bind(models::timestamp(next.deleted_at))
            .bind(self.lookups.backup_status.id(next.backup_status)?)
            .bind(next.id)
            .bind(next.revision)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            exn::bail!(ErrorKind::Conflict(format!("file {} at revision {}", next.id, next.revision)));
        }
        let record = FileRecord {
            revision: next.revision + 1,
            ..next.clone()
        };
        self.append_history(conn, &record, container_id, kind, location_id, observed_at)
            .await?;
        Ok(record)
    }

    /// Recompute a file's aggregate backup status from the backup rows that
    /// exist for its current sha256 at the `required` locations.
    ///
    /// The stored status is never trusted: the file is re-read inside the
    /// transaction. A history row is appended only if the status changes.
    #[instrument(skip(self, required))]
    pub async fn refresh_backup_status(&self, file_id: i64, required: &[i64], attempted: bool) -> Result<FileRecord> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let current = self
            .load_file(&mut tx, file_id)
            .await?
            .ok_or_raise(|| ErrorKind::NotFound(format!("file {file_id}")))?;
        let present = present_at(&mut tx, &current.wiki, current.sha256.as_deref(), required).await?;
        let backup_status = BackupStatus::derive(required.len(), present, attempted);
        if backup_status == current.backup_status {
            return Ok(current);
        }
        let next = FileRecord {
            backup_status,
            ..current
        };
        let record = self
            .write_snapshot(&mut tx, &next, ChangeKind::BackupStatus, None, None)
            .await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        tracing::debug!(file = file_id, status = %backup_status, "backup status changed");
        Ok(record)
    }

    // =========================================================================
    // History
    // =========================================================================

    async fn append_history(
        &self,
        conn: &mut SqliteConnection,
        record: &FileRecord,
        container_id: i64,
        kind: ChangeKind,
        location_id: Option<i64>,
        observed_at: Option<UtcDateTime>,
    ) -> Result<()> {
        sqlx::query(include_str!("../queries/insert_history.sql"))
            .bind(record.id)
            .bind(record.id)
            .bind(kind.as_str())
            .bind(record.upload_name.as_deref())
            .bind(container_id)
            .bind(&record.path)
            .bind(self.lookups.file_types.id(record.file_type)?)
            .bind(self.lookups.file_status.id(record.status)?)
            .bind(record.sha1.as_deref())
            .bind(record.md5.as_deref())
            .bind(record.sha256.as_deref())
            .bind(size(record)?)
            .bind(models::timestamp(record.uploaded_at))
            .bind(models::timestamp(record.archived_at))
            .bind(models::timestamp(record.deleted_at))
            .bind(self.lookups.backup_status.id(record.backup_status)?)
            .bind(location_id)
            .bind(models::timestamp(observed_at))
            .bind(UtcDateTime::now().unix_timestamp())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// The full history of a file, oldest first.
    pub async fn history(&self, file_id: i64) -> Result<Vec<HistoryEntry>> {
        let rows: Vec<HistoryRow> = sqlx::query_as(include_str!("../queries/list_history.sql"))
            .bind(file_id)
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(|row| row.decode(&self.lookups)).collect()
    }

    pub async fn history_count(&self, wiki: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(include_str!("../queries/count_history.sql"))
            .bind(wiki)
            .fetch_one(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        u64::try_from(count).or_raise(|| ErrorKind::InvalidData("history count"))
    }

    /// Lower bound of the next incremental scan of a wiki, if a pass ever
    /// completed.
    pub async fn scan_watermark(&self, wiki: &str) -> Result<Option<UtcDateTime>> {
        let watermark: Option<Option<i64>> = sqlx::query_scalar(include_str!("../queries/get_scan_watermark.sql"))
            .bind(wiki)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        models::datetime(watermark.flatten(), "scan watermark")
    }

    /// Record where the next incremental scan of a wiki resumes. Only call
    /// this once a pass has gone through the whole listing.
    pub async fn set_scan_watermark(&self, wiki: &str, at: UtcDateTime) -> Result<()> {
        let updated = sqlx::query(include_str!("../queries/set_scan_watermark.sql"))
            .bind(at.unix_timestamp())
            .bind(wiki)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if updated.rows_affected() == 0 {
            exn::bail!(ErrorKind::NotFound(format!("wiki {wiki}")));
        }
        Ok(())
    }

    // =========================================================================
    // Backups
    // =========================================================================

    /// Record a confirmed copy.
    ///
    /// The insert is guarded by the `(location, wiki, sha256)` unique key:
    /// if a concurrent writer recorded the same copy first, the existing row
    /// is kept and [`InsertOutcome::AlreadyExists`] is returned.
    #[instrument(skip(self, record), fields(key = %record.key))]
    pub async fn insert_backup(&self, record: &BackupRecord) -> Result<InsertOutcome> {
        let mut conn = self.pool.acquire().await.or_raise(|| ErrorKind::Database)?;
        let location_id = location_id(&mut conn, &record.key.location).await?;
        let wiki_id = wiki_id(&mut conn, &record.key.wiki).await?;
        let result = sqlx::query(include_str!("../queries/insert_backup.sql"))
            .bind(location_id)
            .bind(wiki_id)
            .bind(&record.key.sha256)
            .bind(record.sha1.as_deref())
            .bind(&record.path)
            .bind(record.confirmed_at.unix_timestamp())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(InsertOutcome::from_rows_affected(result.rows_affected()))
    }

    pub async fn get_backup(&self, key: &BackupKey) -> Result<Option<BackupRecord>> {
        let row: Option<BackupRow> = sqlx::query_as(concat!(
            include_str!("../queries/select_backups.sql"),
            " WHERE l.name = ? AND w.name = ? AND b.sha256 = ?"
        ))
        .bind(&key.location)
        .bind(&key.wiki)
        .bind(&key.sha256)
        .fetch_optional(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        row.map(BackupRecord::try_from).transpose()
    }

    /// Every location's copy of one piece of content.
    pub async fn backups_for_content(&self, wiki: &str, sha256: &str) -> Result<Vec<BackupRecord>> {
        let rows: Vec<BackupRow> = sqlx::query_as(concat!(
            include_str!("../queries/select_backups.sql"),
            " WHERE w.name = ? AND b.sha256 = ? ORDER BY l.name"
        ))
        .bind(wiki)
        .bind(sha256)
        .fetch_all(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(BackupRecord::try_from).collect()
    }

    /// Copies whose deletion was started but never completed.
    pub async fn pending_deletions(&self, wiki: Option<&str>) -> Result<Vec<BackupRecord>> {
        let rows: Vec<BackupRow> = sqlx::query_as(concat!(
            include_str!("../queries/select_backups.sql"),
            " WHERE b.deletion_requested_at IS NOT NULL AND (?1 IS NULL OR w.name = ?1)",
            " ORDER BY w.name, b.sha256, l.name"
        ))
        .bind(wiki)
        .fetch_all(&self.pool)
        .await
        .or_raise(|| ErrorKind::Database)?;
        rows.into_iter().map(BackupRecord::try_from).collect()
    }

    /// Stamp a copy as deletion-pending. An earlier stamp is kept.
    pub async fn mark_deletion_requested(&self, key: &BackupKey, at: UtcDateTime) -> Result<bool> {
        let result = sqlx::query(include_str!("../queries/request_backup_deletion.sql"))
            .bind(at.unix_timestamp())
            .bind(&key.location)
            .bind(&key.wiki)
            .bind(&key.sha256)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove the record of a copy whose object is confirmed gone.
    ///
    /// In the same transaction, every file of the wiki holding that content
    /// gets its backup status recomputed over the `required` locations and a
    /// `backup_removed` history row. Files left without any copy fall back
    /// to `none`. Purging a row that is already gone changes nothing and
    /// returns no files.
    #[instrument(skip(self, required), fields(key = %key))]
    pub async fn purge_backup(&self, key: &BackupKey, required: &[i64]) -> Result<Vec<FileRecord>> {
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        let location_id = location_id(&mut tx, &key.location).await?;
        let result = sqlx::query(include_str!("../queries/delete_backup.sql"))
            .bind(&key.location)
            .bind(&key.wiki)
            .bind(&key.sha256)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        if result.rows_affected() == 0 {
            return Ok(Vec::new());
        }
        let rows: Vec<FileRow> = sqlx::query_as(concat!(
            include_str!("../queries/select_files.sql"),
            " WHERE w.name = ? AND f.sha256 = ? ORDER BY f.id"
        ))
        .bind(&key.wiki)
        .bind(&key.sha256)
        .fetch_all(&mut *tx)
        .await
        .or_raise(|| ErrorKind::Database)?;
        let present = present_at(&mut tx, &key.wiki, Some(&key.sha256), required).await?;
        let backup_status = match present {
            0 => BackupStatus::None,
            present => BackupStatus::derive(required.len(), present, true),
        };
        let mut affected = Vec::with_capacity(rows.len());
        for row in rows {
            let next = FileRecord {
                backup_status,
                ..row.decode(&self.lookups)?
            };
            let record = self
                .write_snapshot(&mut tx, &next, ChangeKind::BackupRemoved, Some(location_id), None)
                .await?;
            affected.push(record);
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(affected)
    }
}
