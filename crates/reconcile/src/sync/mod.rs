//! Metadata synchronization: applying detected changes to the store.
//!
//! A change is never applied blindly. The file is re-read and re-diffed
//! right before writing, and the write itself is a compare-and-swap on the
//! snapshot revision; losing that race means reading and diffing again. A
//! change that no longer applies (another pass got there first) is a no-op,
//! which is what makes re-running a pass over an unchanged feed free of
//! mutations.

pub mod error;

use crate::RetryPolicy;
use crate::detect::{self, Change, ScanMode};
use crate::feed::SourceFeed;
use crate::sync::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::StreamExt;
use mediabackups_media::{BackupStatus, FileRecord};
use mediabackups_metadata::error::ErrorKind as MetadataErrorKind;
use mediabackups_metadata::{ChangeKind, Repository};
use time::{Duration, UtcDateTime};

/// How far before the start of a completed pass the next incremental scan
/// resumes. Feed event times come from the source's clocks, not ours.
pub const WATERMARK_OVERLAP: Duration = Duration::minutes(10);

/// What applying one change did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Created(FileRecord),
    Updated(FileRecord),
    Deleted(FileRecord),
    /// The store already reflected the change.
    Unchanged(FileRecord),
}

impl Applied {
    pub fn record(&self) -> &FileRecord {
        match self {
            Self::Created(record) | Self::Updated(record) | Self::Deleted(record) | Self::Unchanged(record) => record,
        }
    }
}

/// Counters of one wiki's synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub unchanged: u64,
    /// Changes abandoned after repeated concurrent modification.
    pub conflicts: u64,
    /// Ids of the files left waiting for a backup run.
    pub pending: Vec<i64>,
}

impl SyncReport {
    pub fn mutations(&self) -> u64 {
        self.created + self.updated + self.deleted
    }
}

async fn apply_once(
    repo: &Repository,
    wiki: &str,
    change: &Change,
    current: Option<FileRecord>,
) -> mediabackups_metadata::error::Result<Applied> {
    let observed_at = change.observed_at();
    let Some(current) = current else {
        let record = repo.insert_file(wiki, change.file(), observed_at).await?;
        return Ok(Applied::Created(record));
    };
    Ok(match detect::diff(Some(&current.file), change.file()) {
        None => Applied::Unchanged(current),
        Some(Change::DeletedFile(mut file)) => {
            file.deleted_at = file.deleted_at.or_else(|| Some(UtcDateTime::now()));
            let next = FileRecord { file, ..current };
            Applied::Deleted(repo.update_file(&next, ChangeKind::Deleted, observed_at).await?)
        },
        Some(change) => {
            let next = FileRecord {
                // Replaced bytes must be hashed again.
                sha256: match current.same_content(change.file()) {
                    true => current.sha256.clone(),
                    false => None,
                },
                file: change.file().clone(),
                backup_status: BackupStatus::Pending,
                ..current
            };
            Applied::Updated(repo.update_file(&next, ChangeKind::Updated, observed_at).await?)
        },
    })
}

/// Apply one change to the file as currently stored.
pub async fn apply(repo: &Repository, wiki: &str, change: &Change, retry: &RetryPolicy) -> Result<Applied> {
    let key = change.key();
    let current = retry
        .run("metadata read", || repo.get_file(wiki, &key))
        .await
        .or_raise(|| ErrorKind::Metadata)?;
    apply_to(repo, wiki, change, current, retry).await
}

/// Apply one change on top of `current`, the caller's view of the file
/// (`None` if it believes the file untracked). Whenever a concurrent writer
/// moved the file on in between, the stored state is read again and the
/// change re-diffed against it.
#[tracing::instrument(level = "debug", skip(repo, change, current, retry), fields(path = %change.file().path))]
pub async fn apply_to(
    repo: &Repository,
    wiki: &str,
    change: &Change,
    current: Option<FileRecord>,
    retry: &RetryPolicy,
) -> Result<Applied> {
    let mut known = Some(current);
    let applied = retry
        .run("metadata sync", || {
            let known = known.take();
            async move {
                let current = match known {
                    Some(current) => current,
                    None => repo.get_file(wiki, &change.key()).await?,
                };
                apply_once(repo, wiki, change, current).await
            }
        })
        .await;
    match applied {
        Ok(applied) => Ok(applied),
        Err(err) if matches!(&*err, MetadataErrorKind::Conflict(_)) => {
            let key = change.key();
            Err(err.raise(ErrorKind::Conflict(format!("{wiki}:{}/{}", key.container, key.path))))
        },
        Err(err) => Err(err).or_raise(|| ErrorKind::Metadata),
    }
}

/// Recompute the aggregate backup status of a file after a backup attempt
/// (or without one, `attempted = false`).
pub async fn finalize(
    repo: &Repository,
    file_id: i64,
    required: &[i64],
    attempted: bool,
    retry: &RetryPolicy,
) -> Result<FileRecord> {
    retry
        .run("backup status refresh", || repo.refresh_backup_status(file_id, required, attempted))
        .await
        .or_raise(|| ErrorKind::Metadata)
}

/// Detect and apply every change of one wiki.
///
/// Conflicts are counted and skipped; any other failure ends the pass, with
/// the changes applied so far kept. Only a full or incremental pass that
/// went through the whole listing moves the wiki's scan watermark, to the
/// time the pass started: a pass cut short is resumed from the old
/// watermark, however recent the events it managed to apply.
#[tracing::instrument(skip(feed, repo, retry))]
pub async fn synchronize(
    feed: &dyn SourceFeed,
    repo: &Repository,
    wiki: &str,
    mode: ScanMode,
    retry: &RetryPolicy,
) -> Result<SyncReport> {
    let started = UtcDateTime::now();
    let mut report = SyncReport::default();
    let changes = detect::detect(feed, repo, wiki, mode, retry);
    futures::pin_mut!(changes);
    while let Some(change) = changes.next().await {
        let change = change.or_raise(|| ErrorKind::Detect)?;
        match apply(repo, wiki, &change, retry).await {
            Ok(Applied::Created(record)) => {
                report.created += 1;
                report.pending.push(record.id);
            },
            Ok(Applied::Updated(record)) => {
                report.updated += 1;
                report.pending.push(record.id);
            },
            Ok(Applied::Deleted(_)) => report.deleted += 1,
            Ok(Applied::Unchanged(_)) => report.unchanged += 1,
            Err(err) if matches!(&*err, ErrorKind::Conflict(_)) => {
                tracing::warn!(wiki, error = %err, "Giving up on concurrently modified file");
                report.conflicts += 1;
            },
            Err(err) => return Err(err),
        }
    }
    if matches!(mode, ScanMode::Full | ScanMode::Incremental) {
        retry
            .run("scan watermark", || repo.set_scan_watermark(wiki, started - WATERMARK_OVERLAP))
            .await
            .or_raise(|| ErrorKind::Metadata)?;
    }
    tracing::info!(
        wiki,
        created = report.created,
        updated = report.updated,
        deleted = report.deleted,
        conflicts = report.conflicts,
        "Synchronized"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use crate::test_support::{WIKI, at, live, repo};
    use mediabackups_media::{BackupKey, BackupRecord, FileStatus, LiveFile};

    const SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    async fn sync(feed: &MemoryFeed, repo: &Repository) -> SyncReport {
        synchronize(feed, repo, WIKI, ScanMode::Full, &RetryPolicy::immediate(2)).await.unwrap()
    }

    #[tokio::test]
    async fn test_rerun_over_unchanged_feed_is_a_no_op() {
        let repo = repo().await;
        let feed = MemoryFeed::new();
        feed.set(WIKI, [live("A.jpg", b"a"), live("B.jpg", b"b")]);

        let first = sync(&feed, &repo).await;
        assert_eq!(first.created, 2);
        assert_eq!(first.pending.len(), 2);
        let history = repo.history_count(WIKI).await.unwrap();

        let second = sync(&feed, &repo).await;
        assert_eq!(second.mutations(), 0);
        assert!(second.pending.is_empty());
        assert_eq!(repo.history_count(WIKI).await.unwrap(), history);

        let third = synchronize(&feed, &repo, WIKI, ScanMode::Incremental, &RetryPolicy::immediate(2))
            .await
            .unwrap();
        assert_eq!(third.mutations(), 0);
        assert_eq!(repo.history_count(WIKI).await.unwrap(), history);
    }

    #[tokio::test]
    async fn test_history_grows_by_one_per_state_change() {
        let repo = repo().await;
        let original = live("A.jpg", b"a");
        let feed = MemoryFeed::new();
        feed.set(WIKI, [original.clone()]);
        sync(&feed, &repo).await;

        let archived = LiveFile {
            status: FileStatus::Archived,
            ..original.clone().archived(at(1_650_000_000))
        };
        feed.set(WIKI, [archived.clone()]);
        sync(&feed, &repo).await;
        sync(&feed, &repo).await;

        feed.remove(WIKI, original.key(), Some(at(1_700_000_000)));
        let report = sync(&feed, &repo).await;
        assert_eq!(report.deleted, 1);

        let record = repo.get_file(WIKI, &original.key()).await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Deleted);
        assert_eq!(record.deleted_at, Some(at(1_700_000_000)));
        let kinds: Vec<_> = repo.history(record.id).await.unwrap().into_iter().map(|entry| entry.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Created, ChangeKind::Updated, ChangeKind::Deleted]);
    }

    #[tokio::test]
    async fn test_replaced_content_clears_sha256() {
        let repo = repo().await;
        let original = live("A.jpg", b"a");
        let created = repo.insert_file(WIKI, &original, original.last_event()).await.unwrap();
        let hashed = FileRecord {
            sha256: Some(SHA256.to_string()),
            backup_status: BackupStatus::Complete,
            ..created
        };
        repo.update_file(&hashed, ChangeKind::Updated, None).await.unwrap();

        let retry = RetryPolicy::immediate(2);
        let renamed = original.clone().with_name("Renamed.jpg");
        let applied = apply(&repo, WIKI, &detect::diff(Some(&original), &renamed).unwrap(), &retry)
            .await
            .unwrap();
        assert_eq!(applied.record().sha256.as_deref(), Some(SHA256));
        assert_eq!(applied.record().backup_status, BackupStatus::Pending);

        let replaced = live("A.jpg", b"new bytes").with_name("Renamed.jpg").uploaded(at(1_650_000_000));
        let applied = apply(&repo, WIKI, &detect::diff(Some(&renamed), &replaced).unwrap(), &retry)
            .await
            .unwrap();
        assert!(matches!(applied, Applied::Updated(_)));
        assert_eq!(applied.record().sha256, None);
    }

    #[tokio::test]
    async fn test_stale_change_is_not_applied() {
        let repo = repo().await;
        let file = live("A.jpg", b"a");
        let change = Change::NewFile(file.clone());
        let retry = RetryPolicy::immediate(2);
        assert!(matches!(apply(&repo, WIKI, &change, &retry).await.unwrap(), Applied::Created(_)));
        // A second worker holding the same detected change.
        assert!(matches!(apply(&repo, WIKI, &change, &retry).await.unwrap(), Applied::Unchanged(_)));
        assert_eq!(repo.history_count(WIKI).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_deletion_keeps_backup_rows() {
        let repo = repo().await;
        let location = repo.ensure_location("dc1", None, true).await.unwrap();
        let file = live("A.jpg", b"a");
        let created = repo.insert_file(WIKI, &file, file.last_event()).await.unwrap();
        let hashed = FileRecord {
            sha256: Some(SHA256.to_string()),
            ..created
        };
        let hashed = repo.update_file(&hashed, ChangeKind::Updated, None).await.unwrap();
        let key = BackupKey::new("dc1", WIKI, SHA256);
        repo.insert_backup(&BackupRecord {
            path: key.object_path("").unwrap(),
            key: key.clone(),
            sha1: file.sha1.clone(),
            confirmed_at: at(1_650_000_000),
            deletion_requested_at: None,
        })
        .await
        .unwrap();
        let retry = RetryPolicy::immediate(2);
        let record = finalize(&repo, hashed.id, &[location.id], true, &retry).await.unwrap();
        assert_eq!(record.backup_status, BackupStatus::Complete);

        let feed = MemoryFeed::new();
        feed.remove(WIKI, file.key(), None);
        assert_eq!(sync(&feed, &repo).await.deleted, 1);
        assert!(repo.get_backup(&key).await.unwrap().is_some());
        let record = repo.get_file_by_id(hashed.id).await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Deleted);
        assert_eq!(record.backup_status, BackupStatus::Complete);
        assert!(record.deleted_at.is_some());
        // The stamped deletion time is ours, not an event of the source.
        let history = repo.history(record.id).await.unwrap();
        let deletion = history.iter().find(|entry| entry.kind == ChangeKind::Deleted).unwrap();
        assert_eq!(deletion.observed_at, file.last_event());
    }

    #[tokio::test]
    async fn test_interrupted_pass_keeps_the_watermark() {
        let repo = repo().await;
        repo.set_scan_watermark(WIKI, at(1_600_000_000)).await.unwrap();
        let newer = live("Newer.jpg", b"n").uploaded(at(1_700_000_000));
        let older = live("Older.jpg", b"o").uploaded(at(1_650_000_000));
        let feed = MemoryFeed::new().with_page_size(1);
        feed.set(WIKI, [newer.clone(), older.clone()]);
        feed.break_at(Some(1));

        let retry = RetryPolicy::immediate(2);
        let err = synchronize(&feed, &repo, WIKI, ScanMode::Incremental, &retry).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Detect));
        assert!(repo.get_file(WIKI, &newer.key()).await.unwrap().is_some());
        assert_eq!(repo.scan_watermark(WIKI).await.unwrap(), Some(at(1_600_000_000)));

        feed.break_at(None);
        let started = UtcDateTime::now();
        let report = synchronize(&feed, &repo, WIKI, ScanMode::Incremental, &retry).await.unwrap();
        assert_eq!(report.created, 1);
        assert!(repo.get_file(WIKI, &older.key()).await.unwrap().is_some());
        let watermark = repo.scan_watermark(WIKI).await.unwrap().unwrap();
        assert!(watermark >= started - WATERMARK_OVERLAP);
    }

    #[tokio::test]
    async fn test_since_pass_leaves_the_watermark() {
        let repo = repo().await;
        let feed = MemoryFeed::new();
        feed.set(WIKI, [live("A.jpg", b"a")]);
        synchronize(&feed, &repo, WIKI, ScanMode::Since(at(1_500_000_000)), &RetryPolicy::immediate(2))
            .await
            .unwrap();
        assert_eq!(repo.scan_watermark(WIKI).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_write_is_reread_and_reapplied() {
        let repo = repo().await;
        let original = live("A.jpg", b"a");
        let stale = repo.insert_file(WIKI, &original, original.last_event()).await.unwrap();
        // Another worker renames the file after our read.
        let renamed = FileRecord {
            file: original.clone().with_name("Renamed.jpg"),
            ..stale.clone()
        };
        repo.update_file(&renamed, ChangeKind::Updated, None).await.unwrap();
        let archived = LiveFile {
            status: FileStatus::Archived,
            ..original.clone().archived(at(1_650_000_000))
        };
        let change = detect::diff(Some(&original), &archived).unwrap();

        let err = apply_to(&repo, WIKI, &change, Some(stale.clone()), &RetryPolicy::immediate(1))
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        assert_eq!(repo.history(stale.id).await.unwrap().len(), 2);

        let applied = apply_to(&repo, WIKI, &change, Some(stale.clone()), &RetryPolicy::immediate(2))
            .await
            .unwrap();
        assert!(matches!(applied, Applied::Updated(_)));
        assert_eq!(applied.record().status, FileStatus::Archived);
        assert_eq!(applied.record().revision, stale.revision + 2);
        assert_eq!(repo.history(stale.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_feed_failure_ends_the_pass() {
        let repo = repo().await;
        let feed = MemoryFeed::new();
        feed.set(WIKI, [live("A.jpg", b"a")]);
        feed.fail_next(5);
        let err = synchronize(&feed, &repo, WIKI, ScanMode::Full, &RetryPolicy::immediate(2))
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::Detect));
        assert_eq!(repo.history_count(WIKI).await.unwrap(), 0);
    }
}
