//! In-memory source feed, for tests and dry runs.

use super::{Page, Presence, SourceFeed};
use crate::feed::error::{ErrorKind, Result};
use async_trait::async_trait;
use mediabackups_media::{FileKey, LiveFile};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use time::UtcDateTime;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Default)]
struct WikiFiles {
    listed: Vec<LiveFile>,
    /// Live, but missing from listings (a lagging feed).
    hidden: Vec<FileKey>,
    removed: HashMap<FileKey, Option<UtcDateTime>>,
}

/// Source feed backed by a map of wiki to descriptors.
///
/// Cursors are plain offsets into the listing. Failures can be injected:
/// the next `n` requests (pages or presence probes) time out.
pub struct MemoryFeed {
    wikis: Mutex<HashMap<String, WikiFiles>>,
    page_size: usize,
    failures: AtomicU32,
    /// Listing offset from which every page request times out.
    broken_from: AtomicUsize,
    page_requests: AtomicU32,
    presence_requests: AtomicU32,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self {
            wikis: Mutex::new(HashMap::new()),
            page_size: DEFAULT_PAGE_SIZE,
            failures: AtomicU32::new(0),
            broken_from: AtomicUsize::new(usize::MAX),
            page_requests: AtomicU32::new(0),
            presence_requests: AtomicU32::new(0),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Replace the listing of a wiki.
    pub fn set(&self, wiki: &str, files: impl IntoIterator<Item = LiveFile>) {
        let mut wikis = self.wikis.lock().unwrap_or_else(|e| e.into_inner());
        let entry = wikis.entry(wiki.to_string()).or_default();
        entry.listed = files.into_iter().collect();
        entry.removed.retain(|key, _| !entry.listed.iter().any(|file| file.key() == *key));
    }

    /// Append a descriptor to the listing, as a feed reporting a new event.
    pub fn push(&self, wiki: &str, file: LiveFile) {
        let mut wikis = self.wikis.lock().unwrap_or_else(|e| e.into_inner());
        let entry = wikis.entry(wiki.to_string()).or_default();
        entry.removed.remove(&file.key());
        entry.listed.push(file);
    }

    /// Keep a file live but leave it out of every listing.
    pub fn hide(&self, wiki: &str, key: FileKey) {
        let mut wikis = self.wikis.lock().unwrap_or_else(|e| e.into_inner());
        let entry = wikis.entry(wiki.to_string()).or_default();
        entry.listed.retain(|file| file.key() != key);
        entry.hidden.push(key);
    }

    /// Remove a file from the source altogether.
    pub fn remove(&self, wiki: &str, key: FileKey, at: Option<UtcDateTime>) {
        let mut wikis = self.wikis.lock().unwrap_or_else(|e| e.into_inner());
        let entry = wikis.entry(wiki.to_string()).or_default();
        entry.listed.retain(|file| file.key() != key);
        entry.hidden.retain(|hidden| *hidden != key);
        entry.removed.insert(key, at);
    }

    /// Make the next `n` requests time out.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make every page starting at `offset` or later time out, as a listing
    /// that keeps dying part-way through. `None` heals it.
    pub fn break_at(&self, offset: Option<usize>) {
        self.broken_from.store(offset.unwrap_or(usize::MAX), Ordering::SeqCst);
    }

    pub fn page_requests(&self) -> u32 {
        self.page_requests.load(Ordering::SeqCst)
    }

    pub fn presence_requests(&self) -> u32 {
        self.presence_requests.load(Ordering::SeqCst)
    }

    fn injected_failure(&self) -> Result<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            exn::bail!(ErrorKind::Timeout);
        }
        Ok(())
    }
}

#[async_trait]
impl SourceFeed for MemoryFeed {
    async fn list_page(&self, wiki: &str, since: Option<UtcDateTime>, cursor: Option<&str>) -> Result<Page> {
        self.page_requests.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        let offset = match cursor {
            None => 0,
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| exn::Exn::from(ErrorKind::Invalid(format!("unknown cursor {cursor}"))))?,
        };
        if offset >= self.broken_from.load(Ordering::SeqCst) {
            exn::bail!(ErrorKind::Timeout);
        }
        let wikis = self.wikis.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = wikis.get(wiki) else {
            return Ok(Page::default());
        };
        let matching: Vec<&LiveFile> = entry
            .listed
            .iter()
            .filter(|file| since.is_none_or(|since| file.last_event().is_some_and(|at| at >= since)))
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        Ok(Page {
            files: matching.get(offset..end).unwrap_or_default().iter().map(|file| (*file).clone()).collect(),
            next: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn presence(&self, wiki: &str, key: &FileKey) -> Result<Presence> {
        self.presence_requests.fetch_add(1, Ordering::SeqCst);
        self.injected_failure()?;
        let wikis = self.wikis.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = wikis.get(wiki) else {
            return Ok(Presence::Removed(None));
        };
        if entry.listed.iter().any(|file| file.key() == *key) || entry.hidden.contains(key) {
            return Ok(Presence::Live);
        }
        Ok(Presence::Removed(entry.removed.get(key).copied().flatten()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediabackups_media::FileStatus;

    fn file(path: &str) -> LiveFile {
        LiveFile::new("wikipedia-test-local-public", path, FileStatus::Public)
    }

    #[tokio::test]
    async fn test_pages_and_cursor() {
        let feed = MemoryFeed::new().with_page_size(2);
        feed.set("testwiki", [file("a/ab/1"), file("a/ab/2"), file("a/ab/3")]);
        let first = feed.list_page("testwiki", None, None).await.unwrap();
        assert_eq!(first.files.len(), 2);
        assert_eq!(first.next.as_deref(), Some("2"));
        let second = feed.list_page("testwiki", None, first.next.as_deref()).await.unwrap();
        assert_eq!(second.files, vec![file("a/ab/3")]);
        assert_eq!(second.next, None);
        let err = feed.list_page("testwiki", None, Some("bogus")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[tokio::test]
    async fn test_presence() {
        let feed = MemoryFeed::new();
        let removed_at = UtcDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        feed.set("testwiki", [file("a/ab/1"), file("a/ab/2"), file("a/ab/3")]);
        feed.hide("testwiki", file("a/ab/2").key());
        feed.remove("testwiki", file("a/ab/3").key(), Some(removed_at));

        assert_eq!(feed.presence("testwiki", &file("a/ab/1").key()).await.unwrap(), Presence::Live);
        assert_eq!(feed.presence("testwiki", &file("a/ab/2").key()).await.unwrap(), Presence::Live);
        assert_eq!(
            feed.presence("testwiki", &file("a/ab/3").key()).await.unwrap(),
            Presence::Removed(Some(removed_at))
        );
        assert_eq!(feed.presence("otherwiki", &file("a/ab/1").key()).await.unwrap(), Presence::Removed(None));
        assert_eq!(feed.list_page("testwiki", None, None).await.unwrap().files, vec![file("a/ab/1")]);
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let feed = MemoryFeed::new();
        feed.fail_next(1);
        let err = feed.list_page("testwiki", None, None).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(feed.list_page("testwiki", None, None).await.is_ok());
    }
}
