use std::ops::Deref;
use time::UtcDateTime;

use super::{BackupStatus, FileStatus, FileType};

/// Identity of a logical media object within a wiki: where its live bytes
/// reside on the source storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey {
    pub container: String,
    pub path: String,
}
impl FileKey {
    pub fn new(container: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            path: path.into(),
        }
    }
}

/// Live-file descriptor, as reported by a source feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFile {
    /// Human-readable title. Absent for deleted files, which are stored
    /// under a content-derived name.
    pub upload_name: Option<String>,
    pub container: String,
    pub path: String,
    pub file_type: FileType,
    pub status: FileStatus,
    /// Hexadecimal, 40 characters.
    pub sha1: Option<String>,
    pub md5: Option<String>,
    pub size: Option<u64>,
    pub uploaded_at: Option<UtcDateTime>,
    pub archived_at: Option<UtcDateTime>,
    pub deleted_at: Option<UtcDateTime>,
}
impl LiveFile {
    pub fn new(container: impl Into<String>, path: impl Into<String>, status: FileStatus) -> Self {
        Self {
            upload_name: None,
            container: container.into(),
            path: path.into(),
            file_type: FileType::default(),
            status,
            sha1: None,
            md5: None,
            size: None,
            uploaded_at: None,
            archived_at: None,
            deleted_at: None,
        }
    }

    pub fn key(&self) -> FileKey {
        FileKey::new(&self.container, &self.path)
    }

    /// Most recent lifecycle event carried by the descriptor.
    pub fn last_event(&self) -> Option<UtcDateTime> {
        [self.uploaded_at, self.archived_at, self.deleted_at].into_iter().flatten().max()
    }

    /// Whether the bytes behind two descriptors can be assumed identical.
    pub fn same_content(&self, other: &LiveFile) -> bool {
        self.sha1 == other.sha1 && self.md5 == other.md5 && self.size == other.size
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.upload_name = Some(name.into());
        self
    }

    pub fn with_sha1(mut self, sha1: impl Into<String>) -> Self {
        self.sha1 = Some(sha1.into());
        self
    }

    pub fn with_md5(mut self, md5: impl Into<String>) -> Self {
        self.md5 = Some(md5.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_type(mut self, file_type: FileType) -> Self {
        self.file_type = file_type;
        self
    }

    pub fn uploaded(mut self, at: UtcDateTime) -> Self {
        self.uploaded_at = Some(at);
        self
    }

    pub fn archived(mut self, at: UtcDateTime) -> Self {
        self.archived_at = Some(at);
        self
    }

    pub fn deleted(mut self, at: UtcDateTime) -> Self {
        self.deleted_at = Some(at);
        self
    }
}

/// Current snapshot of a tracked file, as persisted in the metadata store.
///
/// Derefs to the [`LiveFile`] attributes it was last synchronised from, so
/// a snapshot and a fresh descriptor compare attribute-for-attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub wiki: String,
    /// Incremented on every mutation; used for stale-state detection.
    pub revision: i64,
    pub file: LiveFile,
    pub sha256: Option<String>,
    pub backup_status: BackupStatus,
}
impl Deref for FileRecord {
    type Target = LiveFile;
    fn deref(&self) -> &LiveFile {
        &self.file
    }
}
