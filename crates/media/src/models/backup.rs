use std::fmt::{Display, Formatter, Result as FmtResult};
use time::UtcDateTime;

use crate::error::Result;
use crate::hash;

/// Dedup anchor: at most one confirmed copy per location, wiki and content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupKey {
    pub location: String,
    pub wiki: String,
    pub sha256: String,
}
impl BackupKey {
    pub fn new(location: impl Into<String>, wiki: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            wiki: wiki.into(),
            sha256: sha256.into(),
        }
    }

    /// Object path of the copy on the backup storage:
    /// `{wiki}/{first three hex chars}/{sha256}{suffix}`.
    ///
    /// The suffix belongs to whatever content transform was applied before
    /// storing (empty when stored verbatim).
    pub fn object_path(&self, suffix: &str) -> Result<String> {
        hash::validate_hex("sha256", &self.sha256)?;
        Ok(format!("{}/{}/{}{}", self.wiki, &self.sha256[..3], self.sha256, suffix))
    }
}
impl Display for BackupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}:{}:{}", self.location, self.wiki, self.sha256)
    }
}

/// A confirmed stored copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub key: BackupKey,
    pub sha1: Option<String>,
    /// Object path the copy was written to.
    pub path: String,
    pub confirmed_at: UtcDateTime,
    /// Set when an execute-mode deletion has started but not yet completed.
    pub deletion_requested_at: Option<UtcDateTime>,
}
