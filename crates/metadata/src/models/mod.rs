mod backup;
mod file;
mod history;
mod location;

pub(crate) use self::backup::BackupRow;
pub use self::file::FileFilter;
pub(crate) use self::file::FileRow;
pub(crate) use self::history::HistoryRow;
pub use self::history::{ChangeKind, HistoryEntry};
pub(crate) use self::location::LocationRow;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use time::UtcDateTime;

/// Outcome of inserting a row guarded by a unique key.
///
/// Losing an insert race is an expected result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

impl InsertOutcome {
    pub(crate) fn from_rows_affected(rows: u64) -> Self {
        if rows > 0 { Self::Inserted } else { Self::AlreadyExists }
    }
}

pub(crate) fn timestamp(value: Option<UtcDateTime>) -> Option<i64> {
    value.map(UtcDateTime::unix_timestamp)
}

pub(crate) fn datetime(value: Option<i64>, field: &'static str) -> Result<Option<UtcDateTime>> {
    value
        .map(|ts| UtcDateTime::from_unix_timestamp(ts).or_raise(|| ErrorKind::InvalidData(field)))
        .transpose()
}
