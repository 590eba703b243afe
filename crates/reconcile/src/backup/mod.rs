//! Dedup and backup execution.
//!
//! Copies are content-addressed: one object per (location, wiki, sha256),
//! whatever the number of files sharing that content. For every location
//! enabled for writes, [`backup_file`] either finds the backup row that
//! already covers the content, or writes the bytes, waits for the location
//! to confirm them, and only then inserts the row.
//!
//! No lock is taken. Two workers racing on the same content may both write
//! the (identical) object, but the store's unique key lets exactly one
//! insert through; the loser sees [`InsertOutcome::AlreadyExists`] and
//! reports the copy as deduplicated.
//!
//! An object found on a location without a row is what an interrupted run
//! leaves behind between the write and the insert. It is trusted (if its
//! size matches) and only the row is added.

pub mod error;
mod stream;
mod transform;

pub use self::stream::{BackupEvent, backup, backup_files};
pub use self::transform::{ContentTransform, Identity};
use crate::backup::error::{ErrorKind, Result};
use crate::{Context, Target, sync};
use exn::{OptionExt, ResultExt};
use mediabackups_media::hash::{DigestMismatch, Digests};
use mediabackups_media::{BackupKey, BackupRecord, BackupStatus, FileRecord, LiveFile};
use mediabackups_metadata::error::ErrorKind as MetadataErrorKind;
use mediabackups_metadata::{ChangeKind, InsertOutcome};
use mediabackups_storage::error::ErrorKind as StorageErrorKind;
use std::path::{Path, PathBuf};
use time::UtcDateTime;
use tokio::sync::OnceCell;

/// What happened at one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationOutcome {
    /// Written and confirmed by this run.
    Stored,
    /// Already on the location but not recorded; only the row was added.
    Recovered,
    /// A backup row already covered the content.
    Deduplicated,
    Failed(String),
}

impl LocationOutcome {
    /// Whether the location holds a confirmed copy afterwards.
    pub fn is_present(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Aggregate backup status over one outcome per required location.
pub fn aggregate(outcomes: &[(String, LocationOutcome)]) -> BackupStatus {
    let present = outcomes.iter().filter(|(_, outcome)| outcome.is_present()).count();
    BackupStatus::derive(outcomes.len(), present, true)
}

/// Result of backing up one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    /// Snapshot after its backup status was recomputed.
    pub file: FileRecord,
    /// One entry per enabled location, in configuration order.
    pub outcomes: Vec<(String, LocationOutcome)>,
}

impl BackupReport {
    pub fn status(&self) -> BackupStatus {
        self.file.backup_status
    }

    pub fn outcome(&self, location: &str) -> Option<&LocationOutcome> {
        self.outcomes.iter().find(|(name, _)| name == location).map(|(_, outcome)| outcome)
    }
}

/// Source bytes of one file, read at most once and shared by every
/// location that needs them. Reading verifies the recorded digests.
struct SourceBytes<'a> {
    ctx: &'a Context,
    file: &'a FileRecord,
    path: PathBuf,
    loaded: OnceCell<(Vec<u8>, Digests)>,
}

impl<'a> SourceBytes<'a> {
    fn new(ctx: &'a Context, file: &'a FileRecord) -> Self {
        Self {
            ctx,
            file,
            path: Path::new(&file.container).join(&file.path),
            loaded: OnceCell::new(),
        }
    }

    async fn load(&self) -> Result<&(Vec<u8>, Digests)> {
        let (ctx, file, path) = (self.ctx, self.file, self.path.as_path());
        self.loaded
            .get_or_try_init(|| async move {
                let data = ctx
                    .retry
                    .run("source read", move || ctx.source.read(path))
                    .await
                    .or_raise(|| ErrorKind::SourceRead(path.display().to_string()))?;
                let digests = Digests::of(&data);
                verify(file, &digests)?;
                Ok((data, digests))
            })
            .await
    }
}

fn verify(file: &FileRecord, digests: &Digests) -> Result<()> {
    let mismatch = digests.check(file.sha1.as_deref(), file.md5.as_deref()).or_else(|| {
        file.sha256
            .as_ref()
            .filter(|sha256| !sha256.eq_ignore_ascii_case(&digests.sha256))
            .map(|sha256| DigestMismatch {
                algorithm: "sha256",
                expected: sha256.clone(),
                actual: digests.sha256.clone(),
            })
    });
    if let Some(DigestMismatch {
        algorithm,
        expected,
        actual,
    }) = mismatch
    {
        exn::bail!(ErrorKind::IntegrityMismatch {
            algorithm,
            expected,
            actual
        });
    }
    Ok(())
}

/// Make sure the snapshot has a sha256, hashing the source if needed.
/// Digests the source did not record are filled in too.
///
/// The digests are recorded against the snapshot the caller discovered. If
/// another writer moved the file on since, it is read again: a concurrent
/// hash is taken as is, and replaced bytes abandon this attempt.
async fn resolve_sha256(ctx: &Context, file: &FileRecord, source: &SourceBytes<'_>) -> Result<(FileRecord, String)> {
    if let Some(sha256) = &file.sha256 {
        return Ok((file.clone(), sha256.clone()));
    }
    let (_, digests) = source.load().await?;
    let mut known = Some(file.clone());
    let record = ctx
        .retry
        .run("sha256 record", || {
            let known = known.take();
            async move {
                let current = match known {
                    Some(current) => current,
                    None => ctx
                        .repo
                        .get_file_by_id(file.id)
                        .await?
                        .ok_or_raise(|| MetadataErrorKind::NotFound(format!("file {}", file.id)))?,
                };
                if current.sha256.is_some() || !current.same_content(&file.file) {
                    return Ok(current);
                }
                let next = FileRecord {
                    file: LiveFile {
                        sha1: current.sha1.clone().or_else(|| Some(digests.sha1.clone())),
                        md5: current.md5.clone().or_else(|| Some(digests.md5.clone())),
                        ..current.file.clone()
                    },
                    sha256: Some(digests.sha256.clone()),
                    ..current
                };
                ctx.repo.update_file(&next, ChangeKind::Updated, None).await
            }
        })
        .await
        .or_raise(|| ErrorKind::Metadata)?;
    match record.sha256.clone() {
        Some(sha256) if sha256.eq_ignore_ascii_case(&digests.sha256) => Ok((record, sha256)),
        _ => exn::bail!(ErrorKind::Superseded(file.id)),
    }
}

/// Whether an unrecorded object already on a location can stand in for a
/// write. Sizes are only comparable when bytes are stored verbatim.
fn trusted(ctx: &Context, file: &FileRecord, size: u64) -> bool {
    !ctx.transform.suffix().is_empty() || file.size.is_none_or(|expected| expected == size)
}

async fn store(
    ctx: &Context,
    target: &Target,
    file: &FileRecord,
    sha256: &str,
    source: &SourceBytes<'_>,
) -> Result<LocationOutcome> {
    let location = target.name();
    let key = BackupKey::new(location, &file.wiki, sha256);
    if ctx.repo.get_backup(&key).await.or_raise(|| ErrorKind::Metadata)?.is_some() {
        return Ok(LocationOutcome::Deduplicated);
    }
    let path = key
        .object_path(ctx.transform.suffix())
        .or_raise(|| ErrorKind::RemoteWrite(location.to_string()))?;
    let object = Path::new(&path);
    let _permit = target
        .permits
        .acquire()
        .await
        .or_raise(|| ErrorKind::RemoteWrite(location.to_string()))?;

    let existing = ctx.retry.run("backup probe", || target.backend.stat(object)).await;
    let outcome = match existing {
        Ok(info) if trusted(ctx, file, info.size) => LocationOutcome::Recovered,
        Err(err) if !matches!(&*err, StorageErrorKind::NotFound(_)) => {
            return Err(err).or_raise(|| ErrorKind::RemoteWrite(location.to_string()));
        },
        existing => {
            if let Ok(info) = existing {
                tracing::warn!(location, %path, size = info.size, "Overwriting unrecorded object of unexpected size");
            }
            let (data, _) = source.load().await?;
            let payload = ctx.transform.apply(data.clone()).or_raise(|| ErrorKind::Transform)?;
            ctx.retry
                .run("backup write", || target.backend.put(object, &payload))
                .await
                .or_raise(|| ErrorKind::RemoteWrite(location.to_string()))?;
            LocationOutcome::Stored
        },
    };

    let record = BackupRecord {
        key,
        sha1: file.sha1.clone(),
        path,
        confirmed_at: UtcDateTime::now(),
        deletion_requested_at: None,
    };
    match ctx.repo.insert_backup(&record).await.or_raise(|| ErrorKind::Metadata)? {
        InsertOutcome::Inserted => Ok(outcome),
        InsertOutcome::AlreadyExists => {
            tracing::debug!(location, sha256, "Copy recorded concurrently");
            Ok(LocationOutcome::Deduplicated)
        },
    }
}

/// Back up one file to every location enabled for writes, then recompute
/// its aggregate status from the backup rows.
///
/// A failure at one location is reported in its outcome and does not stop
/// the others. Failing to establish the file's content identity (unreadable
/// source, digest mismatch) fails the whole file, which is then marked
/// [`Failed`](BackupStatus::Failed) unless other copies exist.
#[tracing::instrument(skip_all, fields(wiki = %file.wiki, file = file.id))]
pub async fn backup_file(ctx: &Context, file: &FileRecord) -> Result<BackupReport> {
    let targets: Vec<&Target> = ctx.enabled().collect();
    if targets.is_empty() {
        exn::bail!(ErrorKind::NoLocations);
    }
    let required = ctx.required();
    let source = SourceBytes::new(ctx, file);

    let (file, sha256) = match resolve_sha256(ctx, file, &source).await {
        Ok(resolved) => resolved,
        Err(err) if matches!(&*err, ErrorKind::Metadata | ErrorKind::Superseded(_)) => return Err(err),
        Err(err) => {
            tracing::error!(path = %file.path, error = %err, "Cannot establish content identity");
            sync::finalize(&ctx.repo, file.id, &required, true, &ctx.retry)
                .await
                .or_raise(|| ErrorKind::Metadata)?;
            return Err(err);
        },
    };

    let (record, source) = (&file, &source);
    let sha256 = sha256.as_str();
    let results = futures::future::join_all(
        targets
            .iter()
            .map(|target| async move { (target.name().to_string(), store(ctx, target, record, sha256, source).await) }),
    )
    .await;

    let mut outcomes = Vec::with_capacity(results.len());
    for (location, result) in results {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) if matches!(&*err, ErrorKind::Metadata) => return Err(err),
            Err(err) => {
                tracing::warn!(location, sha256, error = %err, "Backup to location failed");
                LocationOutcome::Failed(err.to_string())
            },
        };
        outcomes.push((location, outcome));
    }

    let file = sync::finalize(&ctx.repo, file.id, &required, true, &ctx.retry)
        .await
        .or_raise(|| ErrorKind::Metadata)?;
    if file.backup_status != aggregate(&outcomes) {
        // Other copies (or a concurrent purge) changed the picture meanwhile.
        tracing::debug!(status = %file.backup_status, "Stored status differs from this run's outcomes");
    }
    Ok(BackupReport { file, outcomes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetryPolicy;
    use crate::test_support::{WIKI, context, live, repo, source};
    use mediabackups_metadata::Repository;
    use mediabackups_storage::StorageBackend;
    use mediabackups_storage::backend::Operation;
    use std::sync::Arc;

    async fn track(repo: &Repository, file: &LiveFile) -> FileRecord {
        repo.insert_file(WIKI, file, file.last_event()).await.unwrap()
    }

    fn object(content: &[u8]) -> String {
        let sha256 = Digests::of(content).sha256;
        format!("{WIKI}/{}/{sha256}", &sha256[..3])
    }

    #[test]
    fn test_aggregate_status() {
        let stored = ("dc1".to_string(), LocationOutcome::Stored);
        let dedup = ("dc2".to_string(), LocationOutcome::Deduplicated);
        let failed = ("dc2".to_string(), LocationOutcome::Failed("down".to_string()));
        assert_eq!(aggregate(&[stored.clone(), dedup]), BackupStatus::Complete);
        assert_eq!(aggregate(&[stored, failed.clone()]), BackupStatus::Partial);
        assert_eq!(aggregate(&[failed]), BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_first_backup_hashes_and_stores_everywhere() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let record = track(&repo, &file).await;
        let (ctx, backends) = context(&repo, source(&[(&file, b"alpha")]), &[("dc1", true), ("dc2", true)]).await;

        let report = backup_file(&ctx, &record).await.unwrap();
        assert_eq!(report.status(), BackupStatus::Complete);
        assert_eq!(report.outcome("dc1"), Some(&LocationOutcome::Stored));
        assert_eq!(report.outcome("dc2"), Some(&LocationOutcome::Stored));
        assert_eq!(report.file.sha256, Some(Digests::of(b"alpha").sha256));
        for backend in &backends {
            assert_eq!(backend.read(Path::new(&object(b"alpha"))).await.unwrap(), b"alpha");
        }
    }

    #[tokio::test]
    async fn test_same_content_is_stored_once_per_location() {
        let repo = repo().await;
        let a = live("A.jpg", b"shared");
        let b = live("B.jpg", b"shared");
        let (a_record, b_record) = (track(&repo, &a).await, track(&repo, &b).await);
        let (ctx, backends) = context(&repo, source(&[(&a, b"shared"), (&b, b"shared")]), &[("dc1", true)]).await;

        let first = backup_file(&ctx, &a_record).await.unwrap();
        let second = backup_file(&ctx, &b_record).await.unwrap();
        assert_eq!(first.outcome("dc1"), Some(&LocationOutcome::Stored));
        assert_eq!(second.outcome("dc1"), Some(&LocationOutcome::Deduplicated));
        assert_eq!(second.status(), BackupStatus::Complete);
        assert_eq!(backends[0].calls(Operation::Write).len(), 1);
        let sha256 = Digests::of(b"shared").sha256;
        assert_eq!(repo.backups_for_content(WIKI, &sha256).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_runs_converge_on_one_row() {
        let repo = repo().await;
        let a = live("A.jpg", b"shared");
        let b = live("B.jpg", b"shared");
        let (a_record, b_record) = (track(&repo, &a).await, track(&repo, &b).await);
        let (ctx, _) = context(&repo, source(&[(&a, b"shared"), (&b, b"shared")]), &[("dc1", true), ("dc2", true)]).await;

        let (first, second) = tokio::join!(backup_file(&ctx, &a_record), backup_file(&ctx, &b_record));
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.status(), BackupStatus::Complete);
        assert_eq!(second.status(), BackupStatus::Complete);
        let sha256 = Digests::of(b"shared").sha256;
        let rows = repo.backups_for_content(WIKI, &sha256).await.unwrap();
        assert_eq!(rows.iter().map(|row| row.key.location.as_str()).collect::<Vec<_>>(), vec!["dc1", "dc2"]);
    }

    #[tokio::test]
    async fn test_unrecorded_object_skips_the_write() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let record = track(&repo, &file).await;
        let (ctx, backends) = context(&repo, source(&[(&file, b"alpha")]), &[("dc1", true)]).await;
        // A previous run wrote the object, then stopped before recording it.
        backends[0].put(Path::new(&object(b"alpha")), b"alpha").await.unwrap();
        let writes = backends[0].calls(Operation::Write).len();

        let report = backup_file(&ctx, &record).await.unwrap();
        assert_eq!(report.outcome("dc1"), Some(&LocationOutcome::Recovered));
        assert_eq!(report.status(), BackupStatus::Complete);
        assert_eq!(backends[0].calls(Operation::Write).len(), writes);
        let sha256 = Digests::of(b"alpha").sha256;
        assert_eq!(repo.backups_for_content(WIKI, &sha256).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_truncated_object_is_rewritten() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let record = track(&repo, &file).await;
        let (ctx, backends) = context(&repo, source(&[(&file, b"alpha")]), &[("dc1", true)]).await;
        backends[0].put(Path::new(&object(b"alpha")), b"al").await.unwrap();

        let report = backup_file(&ctx, &record).await.unwrap();
        assert_eq!(report.outcome("dc1"), Some(&LocationOutcome::Stored));
        assert_eq!(backends[0].read(Path::new(&object(b"alpha"))).await.unwrap(), b"alpha");
    }

    #[tokio::test]
    async fn test_digest_mismatch_fails_the_file() {
        let repo = repo().await;
        let recorded = live("A.jpg", b"what was uploaded");
        let record = track(&repo, &recorded).await;
        let (ctx, backends) = context(&repo, source(&[(&recorded, b"what is stored")]), &[("dc1", true)]).await;

        let err = backup_file(&ctx, &record).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::IntegrityMismatch { algorithm: "sha1", .. }));
        assert!(backends[0].calls(Operation::Write).is_empty());
        let record = repo.get_file_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(record.backup_status, BackupStatus::Failed);
        assert_eq!(record.sha256, None);
    }

    #[tokio::test]
    async fn test_one_failing_location_leaves_a_partial_backup() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let record = track(&repo, &file).await;
        let (ctx, backends) = context(&repo, source(&[(&file, b"alpha")]), &[("dc1", true), ("dc2", true)]).await;
        backends[1].set_failing(Operation::Write, true);

        let report = backup_file(&ctx, &record).await.unwrap();
        assert_eq!(report.outcome("dc1"), Some(&LocationOutcome::Stored));
        assert!(matches!(report.outcome("dc2"), Some(LocationOutcome::Failed(_))));
        assert_eq!(report.status(), BackupStatus::Partial);
        // Bounded by the retry policy of the test context.
        assert_eq!(backends[1].calls(Operation::Write).len(), 2);

        // A later run only needs to fill the gap.
        backends[1].set_failing(Operation::Write, false);
        let report = backup_file(&ctx, &report.file).await.unwrap();
        assert_eq!(report.outcome("dc1"), Some(&LocationOutcome::Deduplicated));
        assert_eq!(report.outcome("dc2"), Some(&LocationOutcome::Stored));
        assert_eq!(report.status(), BackupStatus::Complete);
    }

    #[tokio::test]
    async fn test_unconfirmed_write_is_not_recorded() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let record = track(&repo, &file).await;
        let (ctx, backends) = context(&repo, source(&[(&file, b"alpha")]), &[("dc1", true)]).await;
        backends[0].set_losing_writes(true);

        let report = backup_file(&ctx, &record).await.unwrap();
        assert!(matches!(report.outcome("dc1"), Some(LocationOutcome::Failed(_))));
        assert_eq!(report.status(), BackupStatus::Failed);
        let sha256 = Digests::of(b"alpha").sha256;
        assert!(repo.backups_for_content(WIKI, &sha256).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_locations_are_not_required() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let record = track(&repo, &file).await;
        let (ctx, backends) = context(&repo, source(&[(&file, b"alpha")]), &[("dc1", true), ("old", false)]).await;

        let report = backup_file(&ctx, &record).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.status(), BackupStatus::Complete);
        assert!(backends[1].calls(Operation::Write).is_empty());
    }

    #[tokio::test]
    async fn test_no_enabled_location_is_a_configuration_error() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let record = track(&repo, &file).await;
        let (ctx, _) = context(&repo, source(&[(&file, b"alpha")]), &[("old", false)]).await;

        let err = backup_file(&ctx, &record).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NoLocations));
        let record = repo.get_file_by_id(record.id).await.unwrap().unwrap();
        assert_eq!(record.backup_status, BackupStatus::Pending);
    }

    #[tokio::test]
    async fn test_transform_changes_payload_and_path() {
        struct Reverse;
        impl ContentTransform for Reverse {
            fn suffix(&self) -> &str {
                ".rev"
            }

            fn apply(&self, mut data: Vec<u8>) -> Result<Vec<u8>> {
                data.reverse();
                Ok(data)
            }
        }

        let repo = repo().await;
        let file = live("A.jpg", b"abc");
        let record = track(&repo, &file).await;
        let (ctx, backends) = context(&repo, source(&[(&file, b"abc")]), &[("dc1", true)]).await;
        let ctx = ctx.with_transform(Arc::new(Reverse)).with_retry(RetryPolicy::immediate(1));

        backup_file(&ctx, &record).await.unwrap();
        let stored = backends[0].read(Path::new(&format!("{}.rev", object(b"abc")))).await.unwrap();
        assert_eq!(stored, b"cba");
        assert_eq!(backends[0].paths().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_rename_does_not_fail_hashing() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let stale = track(&repo, &file).await;
        let renamed = FileRecord {
            file: file.clone().with_name("Renamed.jpg"),
            ..stale.clone()
        };
        repo.update_file(&renamed, ChangeKind::Updated, None).await.unwrap();
        let (ctx, _) = context(&repo, source(&[(&file, b"alpha")]), &[("dc1", true)]).await;

        let report = backup_file(&ctx, &stale).await.unwrap();
        assert_eq!(report.status(), BackupStatus::Complete);
        assert_eq!(report.file.sha256, Some(Digests::of(b"alpha").sha256));
        assert_eq!(report.file.upload_name.as_deref(), Some("Renamed.jpg"));
    }

    #[tokio::test]
    async fn test_content_replaced_during_hashing_is_abandoned() {
        let repo = repo().await;
        let file = live("A.jpg", b"alpha");
        let stale = track(&repo, &file).await;
        let replaced = FileRecord {
            file: LiveFile {
                sha1: live("A.jpg", b"omega").sha1,
                ..file.clone()
            },
            ..stale.clone()
        };
        repo.update_file(&replaced, ChangeKind::Updated, None).await.unwrap();
        let (ctx, backends) = context(&repo, source(&[(&file, b"alpha")]), &[("dc1", true)]).await;

        let err = backup_file(&ctx, &stale).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Superseded(id) if *id == stale.id));
        assert!(backends[0].calls(Operation::Write).is_empty());
        let current = repo.get_file_by_id(stale.id).await.unwrap().unwrap();
        assert_eq!(current.sha256, None);
        assert_eq!(current.backup_status, BackupStatus::Pending);
    }
}
