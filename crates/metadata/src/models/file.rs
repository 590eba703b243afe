use exn::ResultExt;
use mediabackups_media::{FileRecord, LiveFile};
use time::UtcDateTime;

use super::datetime;
use crate::Lookups;
use crate::error::{ErrorKind, Result};

#[derive(sqlx::FromRow)]
pub(crate) struct FileRow {
    id: i64,
    wiki: String,
    upload_name: Option<String>,
    storage_container: String,
    storage_path: String,
    file_type: i64,
    status: i64,
    sha1: Option<String>,
    md5: Option<String>,
    sha256: Option<String>,
    size: Option<i64>,
    upload_timestamp: Option<i64>,
    archived_timestamp: Option<i64>,
    deleted_timestamp: Option<i64>,
    backup_status: i64,
    revision: i64,
}
impl FileRow {
    pub(crate) fn decode(self, lookups: &Lookups) -> Result<FileRecord> {
        let file = LiveFile {
            upload_name: self.upload_name,
            container: self.storage_container,
            path: self.storage_path,
            file_type: lookups.file_types.value(self.file_type)?,
            status: lookups.file_status.value(self.status)?,
            sha1: self.sha1,
            md5: self.md5,
            size: self
                .size
                .map(|size| u64::try_from(size).or_raise(|| ErrorKind::InvalidData("file size")))
                .transpose()?,
            uploaded_at: datetime(self.upload_timestamp, "upload date")?,
            archived_at: datetime(self.archived_timestamp, "archive date")?,
            deleted_at: datetime(self.deleted_timestamp, "deletion date")?,
        };
        Ok(FileRecord {
            id: self.id,
            wiki: self.wiki,
            revision: self.revision,
            file,
            sha256: self.sha256,
            backup_status: lookups.backup_status.value(self.backup_status)?,
        })
    }
}

/// Selection of tracked files, used by queries and by deletion worklists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFilter {
    Ids(Vec<i64>),
    /// Exact upload name (title without namespace).
    Title(String),
    /// Hexadecimal sha1.
    Sha1(String),
    Sha256(String),
    SourcePath { container: String, path: String },
    UploadedBetween(UtcDateTime, UtcDateTime),
    ArchivedBetween(UtcDateTime, UtcDateTime),
    DeletedBetween(UtcDateTime, UtcDateTime),
    /// Files whose source was deleted before the given time (retention).
    DeletedBefore(UtcDateTime),
}
