//! Source feed: what the content-hosting system says is live.
//!
//! A [`SourceFeed`] answers two questions per wiki: which files exist (in
//! pages, either all of them or those changed since a point in time), and
//! whether one particular file is still live. [`list_all`] and
//! [`list_since`] turn the paged interface into lazy streams of
//! [`LiveFile`] descriptors, retrying each page with a [`RetryPolicy`].

mod container;
pub mod error;
mod memory;

pub use self::container::ContainerFeed;
pub use self::memory::MemoryFeed;
use crate::RetryPolicy;
use crate::feed::error::Result;
use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use mediabackups_media::{FileKey, LiveFile};
use std::sync::Arc;
use time::UtcDateTime;

pub type FeedHandle = Arc<dyn SourceFeed>;

/// One page of descriptors and the cursor of the page after it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    pub files: Vec<LiveFile>,
    pub next: Option<String>,
}

/// Whether the source still serves a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Live,
    /// Confirmed gone, with the removal time when the source knows it.
    Removed(Option<UtcDateTime>),
}

#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// Fetch one page of descriptors.
    ///
    /// Without `since` every live object of the wiki is listed; with it,
    /// only those whose latest event happened at or after `since`. Pages may
    /// overlap and arrive out of event order.
    async fn list_page(&self, wiki: &str, since: Option<UtcDateTime>, cursor: Option<&str>) -> Result<Page>;

    /// Ask the source directly about a single file.
    async fn presence(&self, wiki: &str, key: &FileKey) -> Result<Presence>;
}

/// Every live file of a wiki.
pub fn list_all<'a>(
    feed: &'a dyn SourceFeed,
    wiki: &'a str,
    retry: &'a RetryPolicy,
) -> impl Stream<Item = Result<LiveFile>> + 'a {
    pages(feed, wiki, None, retry)
}

/// Files of a wiki that changed at or after `since`.
pub fn list_since<'a>(
    feed: &'a dyn SourceFeed,
    wiki: &'a str,
    since: UtcDateTime,
    retry: &'a RetryPolicy,
) -> impl Stream<Item = Result<LiveFile>> + 'a {
    pages(feed, wiki, Some(since), retry)
}

fn pages<'a>(
    feed: &'a dyn SourceFeed,
    wiki: &'a str,
    since: Option<UtcDateTime>,
    retry: &'a RetryPolicy,
) -> impl Stream<Item = Result<LiveFile>> + 'a {
    stream! {
        let mut cursor: Option<String> = None;
        loop {
            let current = cursor.take();
            let current = current.as_deref();
            let page = match retry.run("source feed page", move || feed.list_page(wiki, since, current)).await {
                Ok(page) => page,
                Err(err) => {
                    // A partial listing is never mistaken for a complete one:
                    // the stream ends on the error.
                    yield Err(err);
                    return;
                },
            };
            for file in page.files {
                yield Ok(file);
            }
            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
    }
}
