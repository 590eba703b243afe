//! Batch deletion of backup copies.
//!
//! Nothing is removed unless the caller asks for [`DeleteMode::Execute`];
//! the default is a dry run that reports exactly which copies would go.
//!
//! An executed item moves through three steps, each safe to repeat:
//!
//! 1. the backup row is stamped deletion-pending;
//! 2. the object is deleted from its location, unless it is already gone;
//! 3. the row is purged, and every file holding the content gets its status
//!    recomputed and a history row recording the removal.
//!
//! A run interrupted after step 2 is completed by the next one, which finds
//! the object absent and goes straight to the purge. Items that fail keep
//! their pending stamp and can be selected again with
//! [`Selection::PendingDeletion`].

pub mod error;
pub mod worklist;

use crate::Context;
use crate::delete::error::{ErrorKind, Result};
use crate::delete::worklist::WorklistEntry;
use exn::{OptionExt, ResultExt};
use futures::StreamExt;
use mediabackups_media::{BackupKey, BackupRecord, FileRecord, FileStatus};
use mediabackups_metadata::FileFilter;
use std::collections::BTreeMap;
use std::path::Path;
use time::UtcDateTime;

/// Whether deletions are carried out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeleteMode {
    #[default]
    DryRun,
    Execute,
}

/// Which copies to delete.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Every copy of the content of the files matching `filter`. Retention
    /// runs use [`FileFilter::DeletedBefore`].
    Files { wiki: String, filter: FileFilter },
    /// Every copy of the given contents.
    Content { wiki: String, sha256s: Vec<String> },
    /// Copies whose deletion was started but never completed.
    PendingDeletion { wiki: Option<String> },
    /// Files erased on the wiki side, from a maintenance transcript.
    Worklist(Vec<WorklistEntry>),
}

/// Outcome for one copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemResult {
    /// Dry run: the copy would have been deleted.
    Reported,
    Deleted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub mode: DeleteMode,
    /// One entry per selected copy, ordered by key.
    pub items: Vec<(BackupKey, ItemResult)>,
}

impl DeleteReport {
    fn count(&self, matching: impl Fn(&ItemResult) -> bool) -> usize {
        self.items.iter().filter(|(_, result)| matching(result)).count()
    }

    pub fn reported(&self) -> usize {
        self.count(|result| matches!(result, ItemResult::Reported))
    }

    pub fn deleted(&self) -> usize {
        self.count(|result| matches!(result, ItemResult::Deleted))
    }

    pub fn failed(&self) -> usize {
        self.count(|result| matches!(result, ItemResult::Failed(_)))
    }
}

async fn copies_of(ctx: &Context, files: &[FileRecord], into: &mut BTreeMap<BackupKey, BackupRecord>) -> Result<()> {
    for file in files {
        let Some(sha256) = &file.sha256 else {
            continue;
        };
        if into.keys().any(|key| key.wiki == file.wiki && key.sha256 == *sha256) {
            continue;
        }
        add_content(ctx, &file.wiki, sha256, into).await?;
    }
    Ok(())
}

async fn add_content(
    ctx: &Context,
    wiki: &str,
    sha256: &str,
    into: &mut BTreeMap<BackupKey, BackupRecord>,
) -> Result<()> {
    let copies = ctx
        .repo
        .backups_for_content(wiki, &sha256.to_ascii_lowercase())
        .await
        .or_raise(|| ErrorKind::Metadata)?;
    into.extend(copies.into_iter().map(|copy| (copy.key.clone(), copy)));
    Ok(())
}

/// Resolve a selection into the backup rows it covers.
pub async fn select(ctx: &Context, selection: &Selection) -> Result<Vec<BackupRecord>> {
    let mut copies = BTreeMap::new();
    match selection {
        Selection::Files { wiki, filter } => {
            let files = ctx
                .repo
                .files_matching(Some(wiki), filter)
                .await
                .or_raise(|| ErrorKind::Metadata)?;
            copies_of(ctx, &files, &mut copies).await?;
        },
        Selection::Content { wiki, sha256s } => {
            for sha256 in sha256s {
                add_content(ctx, wiki, sha256, &mut copies).await?;
            }
        },
        Selection::PendingDeletion { wiki } => {
            let pending = ctx
                .repo
                .pending_deletions(wiki.as_deref())
                .await
                .or_raise(|| ErrorKind::Metadata)?;
            copies.extend(pending.into_iter().map(|copy| (copy.key.clone(), copy)));
        },
        Selection::Worklist(entries) => {
            let resolved = worklist::resolve(&ctx.repo, entries.clone()).await?;
            let files: Vec<FileRecord> = resolved
                .iter()
                .flat_map(|(_, resolution)| resolution.files().iter().cloned())
                .collect();
            copies_of(ctx, &files, &mut copies).await?;
        },
    }
    Ok(copies.into_values().collect())
}

/// Refuse to touch content a file still live at the source depends on.
/// Files not hashed yet are matched on the copy's sha1 instead.
async fn ensure_unused(ctx: &Context, copy: &BackupRecord) -> Result<()> {
    let key = &copy.key;
    let mut holders = ctx
        .repo
        .files_matching(Some(&key.wiki), &FileFilter::Sha256(key.sha256.clone()))
        .await
        .or_raise(|| ErrorKind::Metadata)?;
    if let Some(sha1) = &copy.sha1 {
        let unhashed = ctx
            .repo
            .files_matching(Some(&key.wiki), &FileFilter::Sha1(sha1.clone()))
            .await
            .or_raise(|| ErrorKind::Metadata)?;
        holders.extend(unhashed.into_iter().filter(|file| file.sha256.is_none()));
    }
    if let Some(live) = holders.iter().find(|file| file.status != FileStatus::Deleted) {
        exn::bail!(ErrorKind::InUse {
            sha256: key.sha256.clone(),
            file_id: live.id,
        });
    }
    Ok(())
}

async fn delete_copy(ctx: &Context, copy: &BackupRecord, mode: DeleteMode, required: &[i64]) -> Result<ItemResult> {
    let key = &copy.key;
    let location = key.location.as_str();
    ensure_unused(ctx, copy).await?;
    let target = ctx
        .target(location)
        .ok_or_raise(|| ErrorKind::UnknownLocation(location.to_string()))?;
    if mode == DeleteMode::DryRun {
        tracing::warn!(location, path = %copy.path, "Not deleting: dry run");
        return Ok(ItemResult::Reported);
    }

    ctx.repo
        .mark_deletion_requested(key, UtcDateTime::now())
        .await
        .or_raise(|| ErrorKind::Metadata)?;
    let object = Path::new(&copy.path);
    let _permit = target
        .permits
        .acquire()
        .await
        .or_raise(|| ErrorKind::RemoteDelete(location.to_string()))?;
    let present = ctx
        .retry
        .run("backup probe", || target.backend.exists(object))
        .await
        .or_raise(|| ErrorKind::RemoteDelete(location.to_string()))?;
    if present {
        ctx.retry
            .run("backup delete", || target.backend.delete(object))
            .await
            .or_raise(|| ErrorKind::RemoteDelete(location.to_string()))?;
    } else {
        tracing::info!(location, path = %copy.path, "Object already absent, completing purge");
    }

    let files = ctx
        .repo
        .purge_backup(key, required)
        .await
        .or_raise(|| ErrorKind::Metadata)?;
    tracing::info!(location, path = %copy.path, files = files.len(), "Deleted backup copy");
    Ok(ItemResult::Deleted)
}

/// Delete (or, in a dry run, report) every copy a selection covers.
///
/// Failures are confined to their item; only a metadata store failure ends
/// the batch.
#[tracing::instrument(skip(ctx, selection))]
pub async fn delete(ctx: &Context, selection: &Selection, mode: DeleteMode) -> Result<DeleteReport> {
    let copies = select(ctx, selection).await?;
    let required = ctx.required();
    let required = required.as_slice();

    let results: Vec<(BackupKey, Result<ItemResult>)> = futures::stream::iter(copies)
        .map(move |copy| async move {
            let result = delete_copy(ctx, &copy, mode, required).await;
            (copy.key, result)
        })
        .buffer_unordered(ctx.concurrency)
        .collect()
        .await;

    let mut items = Vec::with_capacity(results.len());
    for (key, result) in results {
        let result = match result {
            Ok(result) => result,
            Err(err) if matches!(&*err, ErrorKind::Metadata) => return Err(err),
            Err(err) => {
                tracing::error!(key = %key, error = %err, "Backup copy not deleted");
                ItemResult::Failed(err.to_string())
            },
        };
        items.push((key, result));
    }
    items.sort_by(|(a, _), (b, _)| a.cmp(b));

    let report = DeleteReport { mode, items };
    tracing::info!(
        reported = report.reported(),
        deleted = report.deleted(),
        failed = report.failed(),
        "Deletion batch finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::backup_file;
    use crate::test_support::{WIKI, at, context, live, repo, source};
    use mediabackups_media::hash::Digests;
    use mediabackups_media::{BackupStatus, LiveFile};
    use mediabackups_metadata::{ChangeKind, Repository};
    use mediabackups_storage::StorageBackend;
    use mediabackups_storage::backend::{MockBackend, Operation};
    use std::sync::Arc;

    /// A file backed up to every location, then deleted at the source.
    async fn backed_up(repo: &Repository, locations: &[(&str, bool)]) -> (Context, Vec<Arc<MockBackend>>, LiveFile) {
        let file = live("A.jpg", b"alpha");
        let record = repo.insert_file(WIKI, &file, file.last_event()).await.unwrap();
        let (ctx, backends) = context(repo, source(&[(&file, b"alpha")]), locations).await;
        backup_file(&ctx, &record).await.unwrap();
        let record = repo.get_file_by_id(record.id).await.unwrap().unwrap();
        let deleted = FileRecord {
            file: LiveFile {
                status: FileStatus::Deleted,
                ..record.file.clone().deleted(at(1_700_000_000))
            },
            ..record
        };
        repo.update_file(&deleted, ChangeKind::Deleted, None).await.unwrap();
        (ctx, backends, file)
    }

    fn content() -> Selection {
        Selection::Content {
            wiki: WIKI.to_string(),
            sha256s: vec![Digests::of(b"alpha").sha256],
        }
    }

    #[tokio::test]
    async fn test_dry_run_then_execute() {
        let repo = repo().await;
        let (ctx, backends, file) = backed_up(&repo, &[("dc1", true)]).await;
        let record = repo.get_file(WIKI, &file.key()).await.unwrap().unwrap();
        let history = repo.history(record.id).await.unwrap().len();

        let report = delete(&ctx, &content(), DeleteMode::default()).await.unwrap();
        assert_eq!(report.items.len(), 1);
        assert_eq!(report.items[0].1, ItemResult::Reported);
        assert!(backends[0].calls(Operation::Delete).is_empty());
        assert_eq!(backends[0].paths().await.len(), 1);
        assert!(repo.get_backup(&report.items[0].0).await.unwrap().is_some());
        assert_eq!(repo.history(record.id).await.unwrap().len(), history);

        let report = delete(&ctx, &content(), DeleteMode::Execute).await.unwrap();
        assert_eq!(report.items[0].1, ItemResult::Deleted);
        assert_eq!(backends[0].calls(Operation::Delete).len(), 1);
        assert!(backends[0].paths().await.is_empty());
        assert!(repo.get_backup(&report.items[0].0).await.unwrap().is_none());
        let entries = repo.history(record.id).await.unwrap();
        assert_eq!(entries.len(), history + 1);
        assert_eq!(entries.last().map(|entry| entry.kind), Some(ChangeKind::BackupRemoved));
        let record = repo.get_file_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(record.backup_status, BackupStatus::None);

        // Nothing left to select.
        let report = delete(&ctx, &content(), DeleteMode::Execute).await.unwrap();
        assert!(report.items.is_empty());
    }

    #[tokio::test]
    async fn test_object_already_gone_completes_purge() {
        let repo = repo().await;
        let (ctx, backends, _) = backed_up(&repo, &[("dc1", true)]).await;
        // An earlier run deleted the object, then stopped before the purge.
        for path in backends[0].paths().await {
            backends[0].delete(&path).await.unwrap();
        }
        let deletes = backends[0].calls(Operation::Delete).len();

        let report = delete(&ctx, &content(), DeleteMode::Execute).await.unwrap();
        assert_eq!(report.items[0].1, ItemResult::Deleted);
        assert_eq!(backends[0].calls(Operation::Delete).len(), deletes);
        assert!(repo.get_backup(&report.items[0].0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_live_content_is_never_deleted() {
        let repo = repo().await;
        let (ctx, backends, _) = backed_up(&repo, &[("dc1", true)]).await;
        let twin = live("Twin.jpg", b"alpha");
        let twin = repo.insert_file(WIKI, &twin, twin.last_event()).await.unwrap();
        let hashed = FileRecord {
            sha256: Some(Digests::of(b"alpha").sha256),
            ..twin
        };
        repo.update_file(&hashed, ChangeKind::Updated, None).await.unwrap();

        for mode in [DeleteMode::DryRun, DeleteMode::Execute] {
            let report = delete(&ctx, &content(), mode).await.unwrap();
            assert!(matches!(&report.items[0].1, ItemResult::Failed(reason) if reason.contains("still used")));
        }
        assert!(backends[0].calls(Operation::Delete).is_empty());
    }

    #[tokio::test]
    async fn test_unhashed_live_twin_blocks_deletion() {
        let repo = repo().await;
        let (ctx, backends, _) = backed_up(&repo, &[("dc1", true)]).await;
        // Synced but not backed up yet: only the source's sha1 is known.
        let twin = live("Twin.jpg", b"alpha");
        let twin = repo.insert_file(WIKI, &twin, twin.last_event()).await.unwrap();
        assert_eq!(twin.sha256, None);

        for mode in [DeleteMode::DryRun, DeleteMode::Execute] {
            let report = delete(&ctx, &content(), mode).await.unwrap();
            assert!(matches!(&report.items[0].1, ItemResult::Failed(reason) if reason.contains("still used")));
        }
        assert!(backends[0].calls(Operation::Delete).is_empty());
        assert!(repo.get_backup(&BackupKey::new("dc1", WIKI, Digests::of(b"alpha").sha256)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_location_stays_pending() {
        let repo = repo().await;
        let (ctx, backends, file) = backed_up(&repo, &[("dc1", true), ("dc2", true)]).await;
        backends[1].set_failing(Operation::Delete, true);

        let report = delete(&ctx, &content(), DeleteMode::Execute).await.unwrap();
        assert_eq!(report.deleted(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.items[0].1, ItemResult::Deleted);
        let record = repo.get_file(WIKI, &file.key()).await.unwrap().unwrap();
        assert_eq!(record.backup_status, BackupStatus::Partial);

        let pending = Selection::PendingDeletion { wiki: None };
        let copies = select(&ctx, &pending).await.unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].key.location, "dc2");

        backends[1].set_failing(Operation::Delete, false);
        let report = delete(&ctx, &pending, DeleteMode::Execute).await.unwrap();
        assert_eq!(report.deleted(), 1);
        assert!(select(&ctx, &pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_location_fails_the_item() {
        let repo = repo().await;
        let (ctx, _, _) = backed_up(&repo, &[("dc1", true)]).await;
        let ctx = Context {
            targets: Vec::new(),
            ..ctx
        };
        let report = delete(&ctx, &content(), DeleteMode::DryRun).await.unwrap();
        assert!(matches!(&report.items[0].1, ItemResult::Failed(reason) if reason.contains("dc1")));
    }

    #[tokio::test]
    async fn test_retention_selection() {
        let repo = repo().await;
        let (ctx, _, _) = backed_up(&repo, &[("dc1", true)]).await;
        let selection = |before| Selection::Files {
            wiki: WIKI.to_string(),
            filter: FileFilter::DeletedBefore(at(before)),
        };
        assert!(select(&ctx, &selection(1_600_000_000)).await.unwrap().is_empty());
        assert_eq!(select(&ctx, &selection(1_800_000_000)).await.unwrap().len(), 1);
    }
}
