//! Object metadata returned by storage backends.

use std::path::PathBuf;
use time::UtcDateTime;

/// Object metadata returned by storage backends, used for listing and for
/// confirming writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Relative path from storage root
    pub path: PathBuf,
    /// Object size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: UtcDateTime,
    /// MD5 of the stored bytes, when the backend reports one.
    pub md5: Option<String>,
}
impl FileInfo {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: UtcDateTime) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
            md5: None,
        }
    }

    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }
}
