use exn::ResultExt;
use mediabackups_media::{BackupStatus, LiveFile};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use time::UtcDateTime;

use super::datetime;
use crate::Lookups;
use crate::error::{Error, ErrorKind, Result};

/// Why a history row was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// First sighting of the file.
    Created,
    /// Attributes reported by the source changed, or the sha256 was resolved.
    Updated,
    /// The source reports the file as deleted.
    Deleted,
    /// Aggregate backup status changed after a backup run.
    BackupStatus,
    /// A stored copy was removed by the deletion engine.
    BackupRemoved,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::BackupStatus => "backup_status",
            Self::BackupRemoved => "backup_removed",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "created" => Self::Created,
            "updated" => Self::Updated,
            "deleted" => Self::Deleted,
            "backup_status" => Self::BackupStatus,
            "backup_removed" => Self::BackupRemoved,
            _ => exn::bail!(ErrorKind::InvalidData("history change kind")),
        })
    }
}

impl Display for ChangeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// One immutable row of a file's history: the state *after* the change,
/// linked to the row holding the state before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub id: i64,
    pub file_id: i64,
    pub previous: Option<i64>,
    pub kind: ChangeKind,
    pub wiki: String,
    pub file: LiveFile,
    pub sha256: Option<String>,
    pub backup_status: BackupStatus,
    /// Backup location concerned by the change, if any.
    pub location: Option<String>,
    /// Event time reported by the source; absent for internal changes.
    pub observed_at: Option<UtcDateTime>,
    pub recorded_at: UtcDateTime,
}

#[derive(sqlx::FromRow)]
pub(crate) struct HistoryRow {
    id: i64,
    file: i64,
    previous: Option<i64>,
    change_kind: String,
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
    location: Option<String>,
    observed_at: Option<i64>,
    recorded_at: i64,
}
impl HistoryRow {
    pub(crate) fn decode(self, lookups: &Lookups) -> Result<HistoryEntry> {
        Ok(HistoryEntry {
            id: self.id,
            file_id: self.file,
            previous: self.previous,
            kind: self.change_kind.parse()?,
            wiki: self.wiki,
            file: LiveFile {
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
            },
            sha256: self.sha256,
            backup_status: lookups.backup_status.value(self.backup_status)?,
            location: self.location,
            observed_at: datetime(self.observed_at, "observation date")?,
            recorded_at: UtcDateTime::from_unix_timestamp(self.recorded_at)
                .or_raise(|| ErrorKind::InvalidData("recording date"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_kind_names() {
        assert_eq!(ChangeKind::BackupRemoved.to_string(), "backup_removed");
        assert_eq!("backup_status".parse::<ChangeKind>().unwrap(), ChangeKind::BackupStatus);
        let err = "renamed".parse::<ChangeKind>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    }
}
