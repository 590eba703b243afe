//! Change detection: diffing the source feed against tracked snapshots.
//!
//! [`detect`] yields one [`Change`] per descriptor that differs from what
//! the metadata store (or an earlier change of the same run) says about its
//! file. It writes nothing, so a detection interrupted at any point can
//! simply be started again.
//!
//! Descriptors are matched by identity (wiki, container, path), never by
//! feed order: duplicates collapse into a single change, and a descriptor
//! older than the state already known for its file is ignored.

pub mod error;

use crate::RetryPolicy;
use crate::detect::error::{Error, ErrorKind, Result};
use crate::feed::{self, Presence, SourceFeed};
use async_stream::stream;
use exn::ResultExt;
use futures::Stream;
use mediabackups_media::{FileKey, FileStatus, LiveFile};
use mediabackups_metadata::Repository;
use std::collections::{HashMap, HashSet};
use time::UtcDateTime;

/// How much of the source feed a detection pass reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Every live object; the only mode that can detect deletions.
    Full,
    /// Entries changed since the latest event already recorded for the wiki.
    /// Falls back to [`Full`](Self::Full) for a wiki never scanned before.
    Incremental,
    /// Entries changed at or after the given time.
    Since(UtcDateTime),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    NewFile(LiveFile),
    /// Same identity, different attributes. `content_changed` is set when
    /// the bytes were replaced (hashes or size differ).
    UpdatedFile {
        file: LiveFile,
        content_changed: bool,
    },
    /// A tracked file the source confirmed is no longer live.
    DeletedFile(LiveFile),
}

impl Change {
    /// State of the file after the change.
    pub fn file(&self) -> &LiveFile {
        match self {
            Self::NewFile(file) | Self::DeletedFile(file) => file,
            Self::UpdatedFile { file, .. } => file,
        }
    }

    pub fn key(&self) -> FileKey {
        self.file().key()
    }

    /// Source event time, recorded in the history row.
    pub fn observed_at(&self) -> Option<UtcDateTime> {
        self.file().last_event()
    }
}

/// Compare a descriptor against the known state of its file.
pub fn diff(baseline: Option<&LiveFile>, file: &LiveFile) -> Option<Change> {
    let Some(baseline) = baseline else {
        return Some(Change::NewFile(file.clone()));
    };
    if baseline == file {
        return None;
    }
    if let (Some(seen), Some(known)) = (file.last_event(), baseline.last_event())
        && seen < known
    {
        return None;
    }
    if file.status == FileStatus::Deleted && baseline.status != FileStatus::Deleted {
        return Some(Change::DeletedFile(file.clone()));
    }
    Some(Change::UpdatedFile {
        file: file.clone(),
        content_changed: !baseline.same_content(file),
    })
}

/// Stream the changes of one wiki.
///
/// The stream ends with an error if the feed or the metadata store fails;
/// changes yielded before that are valid. Deletions are only reported once
/// a [full](ScanMode::Full) listing completed, and only for files the
/// source confirms are gone.
pub fn detect<'a>(
    feed: &'a dyn SourceFeed,
    repo: &'a Repository,
    wiki: &'a str,
    mode: ScanMode,
    retry: &'a RetryPolicy,
) -> impl Stream<Item = Result<Change>> + 'a {
    stream! {
        let since = match mode {
            ScanMode::Full => None,
            ScanMode::Since(since) => Some(since),
            ScanMode::Incremental => match repo.scan_watermark(wiki).await.or_raise(|| ErrorKind::Metadata) {
                Ok(None) => {
                    tracing::info!(wiki, "No completed scan, falling back to a full scan");
                    None
                },
                Ok(since) => since,
                Err(err) => {
                    yield Err(err);
                    return;
                },
            },
        };
        match since {
            None => {
                for await change in detect_full(feed, repo, wiki, retry) {
                    yield change;
                }
            },
            Some(since) => {
                for await change in detect_since(feed, repo, wiki, since, retry) {
                    yield change;
                }
            },
        }
    }
}

/// Retries are exhausted by the time a feed error reaches the detector; a
/// still-retryable error means the feed is only temporarily down.
#[track_caller]
fn feed_failure(err: feed::error::Error, wiki: &str) -> Error {
    let kind = match err.is_retryable() {
        true => ErrorKind::TransientFeed(wiki.to_string()),
        false => ErrorKind::Feed(wiki.to_string()),
    };
    err.raise(kind)
}

fn detect_full<'a>(
    feed: &'a dyn SourceFeed,
    repo: &'a Repository,
    wiki: &'a str,
    retry: &'a RetryPolicy,
) -> impl Stream<Item = Result<Change>> + 'a {
    stream! {
        let tracked: HashMap<FileKey, LiveFile> = match repo.list_files(wiki).await.or_raise(|| ErrorKind::Metadata) {
            Ok(records) => records.into_iter().map(|record| (record.key(), record.file)).collect(),
            Err(err) => {
                yield Err(err);
                return;
            },
        };
        let mut emitted: HashMap<FileKey, LiveFile> = HashMap::new();
        let mut seen: HashSet<FileKey> = HashSet::new();

        for await file in feed::list_all(feed, wiki, retry) {
            let file = match file {
                Ok(file) => file,
                Err(err) => {
                    // The listing is incomplete: absent files prove nothing.
                    yield Err(feed_failure(err, wiki));
                    return;
                },
            };
            let key = file.key();
            let baseline = emitted.get(&key).or_else(|| tracked.get(&key));
            if let Some(change) = diff(baseline, &file) {
                emitted.insert(key.clone(), change.file().clone());
                yield Ok(change);
            }
            seen.insert(key);
        }

        let mut missing: Vec<(&FileKey, &LiveFile)> = tracked
            .iter()
            .filter(|(key, file)| file.status != FileStatus::Deleted && !seen.contains(*key))
            .collect();
        missing.sort_by(|a, b| a.0.cmp(b.0));
        for (key, file) in missing {
            match retry.run("source presence probe", move || feed.presence(wiki, key)).await {
                Ok(Presence::Live) => {
                    tracing::debug!(wiki, container = %key.container, path = %key.path, "Unlisted file is still live");
                },
                // Without a removal time from the source, the synchronizer
                // stamps one that is never taken for a source event.
                Ok(Presence::Removed(removed_at)) => {
                    yield Ok(Change::DeletedFile(LiveFile {
                        status: FileStatus::Deleted,
                        deleted_at: removed_at,
                        ..file.clone()
                    }));
                },
                Err(err) => {
                    tracing::warn!(wiki, path = %key.path, error = %err, "Could not confirm removal, keeping file");
                },
            }
        }
    }
}

fn detect_since<'a>(
    feed: &'a dyn SourceFeed,
    repo: &'a Repository,
    wiki: &'a str,
    since: UtcDateTime,
    retry: &'a RetryPolicy,
) -> impl Stream<Item = Result<Change>> + 'a {
    stream! {
        let mut emitted: HashMap<FileKey, LiveFile> = HashMap::new();
        for await file in feed::list_since(feed, wiki, since, retry) {
            let file = match file {
                Ok(file) => file,
                Err(err) => {
                    yield Err(feed_failure(err, wiki));
                    return;
                },
            };
            let key = file.key();
            let baseline = match emitted.get(&key) {
                Some(known) => Some(known.clone()),
                None => match repo.get_file(wiki, &key).await.or_raise(|| ErrorKind::Metadata) {
                    Ok(record) => record.map(|record| record.file),
                    Err(err) => {
                        yield Err(err);
                        return;
                    },
                },
            };
            if let Some(change) = diff(baseline.as_ref(), &file) {
                emitted.insert(key, change.file().clone());
                yield Ok(change);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use crate::test_support::{WIKI, at, live, repo};
    use futures::{StreamExt, TryStreamExt};

    async fn changes(feed: &MemoryFeed, repo: &Repository, mode: ScanMode) -> Result<Vec<Change>> {
        let retry = RetryPolicy::immediate(2);
        detect(feed, repo, WIKI, mode, &retry).try_collect().await
    }

    #[test]
    fn test_diff_rules() {
        let file = live("A.jpg", b"a");
        assert_eq!(diff(None, &file), Some(Change::NewFile(file.clone())));
        assert_eq!(diff(Some(&file), &file), None);

        let replaced = live("A.jpg", b"b").uploaded(at(1_600_000_100));
        assert_eq!(
            diff(Some(&file), &replaced),
            Some(Change::UpdatedFile {
                file: replaced.clone(),
                content_changed: true
            })
        );
        // Older than what is already known.
        assert_eq!(diff(Some(&replaced), &file), None);

        let renamed = file.clone().with_name("B.jpg");
        assert!(matches!(
            diff(Some(&file), &renamed),
            Some(Change::UpdatedFile {
                content_changed: false,
                ..
            })
        ));

        let deleted = LiveFile {
            status: FileStatus::Deleted,
            ..file.clone().deleted(at(1_700_000_000))
        };
        assert_eq!(diff(Some(&file), &deleted), Some(Change::DeletedFile(deleted.clone())));
    }

    #[tokio::test]
    async fn test_new_files_on_empty_store() {
        let repo = repo().await;
        let feed = MemoryFeed::new();
        feed.set(WIKI, [live("A.jpg", b"a"), live("B.jpg", b"b")]);
        let found = changes(&feed, &repo, ScanMode::Full).await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|change| matches!(change, Change::NewFile(_))));
    }

    #[tokio::test]
    async fn test_tracked_files_produce_no_changes() {
        let repo = repo().await;
        let file = live("A.jpg", b"a");
        repo.insert_file(WIKI, &file, file.last_event()).await.unwrap();
        let feed = MemoryFeed::new();
        feed.set(WIKI, [file.clone()]);
        assert!(changes(&feed, &repo, ScanMode::Full).await.unwrap().is_empty());
        assert!(changes(&feed, &repo, ScanMode::Incremental).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicates_and_stale_entries_collapse() {
        let repo = repo().await;
        let first = live("A.jpg", b"a");
        let second = live("A.jpg", b"b").uploaded(at(1_600_000_100));
        let feed = MemoryFeed::new();
        feed.set(WIKI, [first.clone(), second.clone(), first.clone(), second.clone()]);
        let found = changes(&feed, &repo, ScanMode::Full).await.unwrap();
        assert_eq!(
            found,
            vec![
                Change::NewFile(first),
                Change::UpdatedFile {
                    file: second,
                    content_changed: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_confirmed_removal_is_a_deletion() {
        let repo = repo().await;
        let kept = live("Kept.jpg", b"k");
        let lagging = live("Lagging.jpg", b"l");
        let removed = live("Removed.jpg", b"r");
        for file in [&kept, &lagging, &removed] {
            repo.insert_file(WIKI, file, file.last_event()).await.unwrap();
        }
        let feed = MemoryFeed::new();
        feed.set(WIKI, [kept.clone(), lagging.clone(), removed.clone()]);
        feed.hide(WIKI, lagging.key());
        feed.remove(WIKI, removed.key(), Some(at(1_700_000_000)));

        let found = changes(&feed, &repo, ScanMode::Full).await.unwrap();
        let expected = LiveFile {
            status: FileStatus::Deleted,
            ..removed.deleted(at(1_700_000_000))
        };
        assert_eq!(found, vec![Change::DeletedFile(expected)]);
        assert_eq!(feed.presence_requests(), 2);
    }

    #[tokio::test]
    async fn test_partial_listing_reports_no_deletions() {
        let repo = repo().await;
        let listed = [live("A.jpg", b"a"), live("B.jpg", b"b")];
        let removed = live("C.jpg", b"c");
        repo.insert_file(WIKI, &removed, removed.last_event()).await.unwrap();
        let feed = MemoryFeed::new().with_page_size(1);
        feed.set(WIKI, listed.clone());
        feed.remove(WIKI, removed.key(), None);

        let retry = RetryPolicy::immediate(2);
        let stream = detect(&feed, &repo, WIKI, ScanMode::Full, &retry);
        futures::pin_mut!(stream);
        assert!(matches!(stream.next().await, Some(Ok(Change::NewFile(_)))));
        // The second page never arrives.
        feed.fail_next(10);
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(&*err, ErrorKind::TransientFeed(wiki) if wiki == WIKI));
        assert!(stream.next().await.is_none());
        assert_eq!(feed.presence_requests(), 0);
    }

    #[tokio::test]
    async fn test_incremental_reads_from_watermark() {
        let repo = repo().await;
        let tracked = live("Tracked.jpg", b"t");
        repo.insert_file(WIKI, &tracked, tracked.last_event()).await.unwrap();
        let ancient = live("Ancient.jpg", b"a").uploaded(at(1_500_000_000));
        let fresh = live("Fresh.jpg", b"f").uploaded(at(1_650_000_000));
        let feed = MemoryFeed::new();
        // `tracked` is gone from the feed, but an incremental pass cannot tell.
        feed.set(WIKI, [ancient, fresh.clone(), fresh.clone()]);

        repo.set_scan_watermark(WIKI, at(1_600_000_000)).await.unwrap();

        let found = changes(&feed, &repo, ScanMode::Incremental).await.unwrap();
        assert_eq!(found, vec![Change::NewFile(fresh)]);
        assert_eq!(feed.presence_requests(), 0);
    }

    #[tokio::test]
    async fn test_incremental_without_watermark_scans_everything() {
        let repo = repo().await;
        let feed = MemoryFeed::new();
        feed.set(WIKI, [live("A.jpg", b"a")]);
        let found = changes(&feed, &repo, ScanMode::Incremental).await.unwrap();
        assert_eq!(found.len(), 1);
    }
}
