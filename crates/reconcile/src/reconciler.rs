use crate::Context;
use crate::backup::{self, BackupEvent};
use crate::detect::ScanMode;
use crate::error::{Error, ErrorKind, Result};
use crate::feed::FeedHandle;
use crate::sync::{self, SyncReport};
use exn::ResultExt;
use futures::{Stream, StreamExt};
use mediabackups_media::{BackupStatus, WikiType};

/// What a run did for one wiki.
#[derive(Debug, Default)]
pub struct WikiSummary {
    pub wiki: String,
    /// Present when the wiki was synchronized.
    pub sync: Option<SyncReport>,
    /// Files backed up to every enabled location.
    pub complete: u64,
    pub partial: u64,
    /// Files with no copy at all after the attempt, or whose backup could
    /// not even start (digest mismatch, unreadable source).
    pub failed: u64,
    /// Why the wiki's run stopped early.
    pub error: Option<Error>,
}

impl WikiSummary {
    fn new(wiki: &str) -> Self {
        Self {
            wiki: wiki.to_string(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.failed == 0
    }
}

/// Runs the engine stages over many wikis. Every wiki is processed on its
/// own: a failure stops that wiki, never the others.
pub struct Reconciler {
    ctx: Context,
    feed: FeedHandle,
}

impl Reconciler {
    pub fn new(ctx: Context, feed: FeedHandle) -> Self {
        Self { ctx, feed }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Start tracking wikis. Wikis already known keep their type.
    pub async fn register(&self, wikis: &[(String, WikiType)]) -> Result<()> {
        for (wiki, wiki_type) in wikis {
            self.ctx
                .repo
                .ensure_wiki(wiki, *wiki_type)
                .await
                .or_raise(|| ErrorKind::Configuration(format!("cannot register wiki {wiki}")))?;
        }
        Ok(())
    }

    async fn synchronize(&self, wiki: &str, mode: ScanMode) -> Result<SyncReport> {
        let known = self
            .ctx
            .repo
            .wiki_type(wiki)
            .await
            .or_raise(|| ErrorKind::Sync(wiki.to_string()))?;
        if known.is_none() {
            tracing::info!(wiki, "Registering unknown wiki as public");
            self.register(&[(wiki.to_string(), WikiType::Public)]).await?;
        }
        sync::synchronize(self.feed.as_ref(), &self.ctx.repo, wiki, mode, &self.ctx.retry)
            .await
            .or_raise(|| ErrorKind::Sync(wiki.to_string()))
    }

    /// Detect and apply source changes for every wiki.
    pub async fn update(&self, wikis: &[String], mode: ScanMode) -> Vec<WikiSummary> {
        let mut summaries = Vec::with_capacity(wikis.len());
        for wiki in wikis {
            let mut summary = WikiSummary::new(wiki);
            match self.synchronize(wiki, mode).await {
                Ok(report) => summary.sync = Some(report),
                Err(err) => {
                    tracing::error!(wiki = %wiki, error = %err, "Update failed");
                    summary.error = Some(err);
                },
            }
            summaries.push(summary);
        }
        summaries
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.ctx.enabled().next().is_none() {
            exn::bail!(ErrorKind::Configuration("no location is enabled for writes".to_string()));
        }
        Ok(())
    }

    /// Back up every outstanding file of every wiki.
    ///
    /// Refuses to start without a location enabled for writes.
    pub async fn backup(&self, wikis: &[String]) -> Result<Vec<WikiSummary>> {
        self.ensure_writable()?;
        let mut summaries = Vec::with_capacity(wikis.len());
        for wiki in wikis {
            let mut summary = WikiSummary::new(wiki);
            tally(&mut summary, backup::backup(&self.ctx, wiki)).await;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Incremental update followed by a backup of exactly the files it
    /// created or updated, to bound the latency of new uploads.
    pub async fn quick_backup(&self, wikis: &[String]) -> Result<Vec<WikiSummary>> {
        self.ensure_writable()?;
        let mut summaries = Vec::with_capacity(wikis.len());
        for wiki in wikis {
            let mut summary = WikiSummary::new(wiki);
            match self.synchronize(wiki, ScanMode::Incremental).await {
                Ok(report) => {
                    tally(&mut summary, backup::backup_files(&self.ctx, &report.pending)).await;
                    summary.sync = Some(report);
                },
                Err(err) => {
                    tracing::error!(wiki = %wiki, error = %err, "Quick backup failed");
                    summary.error = Some(err);
                },
            }
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

async fn tally(summary: &mut WikiSummary, events: impl Stream<Item = Result<BackupEvent>>) {
    futures::pin_mut!(events);
    let mut discovered = false;
    while let Some(event) = events.next().await {
        match event {
            Ok(BackupEvent::DiscoveryComplete(total)) => {
                discovered = true;
                tracing::info!(wiki = %summary.wiki, total, "Backing up");
            },
            Ok(BackupEvent::BackedUp(report)) => match report.status() {
                BackupStatus::Complete => summary.complete += 1,
                BackupStatus::Partial => summary.partial += 1,
                _ => summary.failed += 1,
            },
            Ok(BackupEvent::Started | BackupEvent::Complete) => {},
            Err(err) if discovered => {
                tracing::warn!(wiki = %summary.wiki, error = %err, "File not backed up");
                summary.failed += 1;
            },
            Err(err) => {
                tracing::error!(wiki = %summary.wiki, error = %err, "Backup failed");
                summary.error = Some(err);
            },
        }
    }
    tracing::info!(
        wiki = %summary.wiki,
        complete = summary.complete,
        partial = summary.partial,
        failed = summary.failed,
        "Backup finished"
    );
}
