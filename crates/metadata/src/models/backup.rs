use exn::ResultExt;
use mediabackups_media::{BackupKey, BackupRecord};
use time::UtcDateTime;

use super::datetime;
use crate::error::{Error, ErrorKind};

#[derive(sqlx::FromRow)]
pub(crate) struct BackupRow {
    location: String,
    wiki: String,
    sha256: String,
    sha1: Option<String>,
    backup_path: String,
    confirmed_at: i64,
    deletion_requested_at: Option<i64>,
}
impl TryFrom<BackupRow> for BackupRecord {
    type Error = Error;
    fn try_from(row: BackupRow) -> Result<Self, Self::Error> {
        Ok(BackupRecord {
            key: BackupKey::new(row.location, row.wiki, row.sha256),
            sha1: row.sha1,
            path: row.backup_path,
            confirmed_at: UtcDateTime::from_unix_timestamp(row.confirmed_at)
                .or_raise(|| ErrorKind::InvalidData("confirmation date"))?,
            deletion_requested_at: datetime(row.deletion_requested_at, "deletion request date")?,
        })
    }
}
