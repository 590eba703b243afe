//! Reconciliation and deduplication engine for wiki media backups.
//!
//! Three sources of truth are kept in agreement: what the source feed says
//! is live, what the metadata store tracks, and which content-addressed
//! copies exist on each backup location.
//!
//! - [`detect`] diffs the source feed against the tracked snapshots.
//! - [`sync`] applies those changes to the metadata store, bundling every
//!   snapshot mutation with its history row.
//! - [`backup`] makes sure every enabled location holds exactly one copy
//!   of each distinct content per wiki.
//! - [`delete`] removes copies under explicit dry-run/execute control.
//!
//! [`Reconciler`] chains the stages over many wikis.

pub mod backup;
pub mod delete;
pub mod detect;
pub mod error;
pub mod feed;
mod reconciler;
mod retry;
pub mod sync;
#[cfg(test)]
mod test_support;

pub use crate::reconciler::{Reconciler, WikiSummary};
pub use crate::retry::{RetryPolicy, Retryable};
use crate::backup::{ContentTransform, Identity};
use mediabackups_media::Location;
use mediabackups_metadata::Repository;
use mediabackups_storage::BackendHandle;
use mediabackups_storage::backend::ReadOnlyBackend;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Files backed up at the same time.
pub const DEFAULT_CONCURRENCY: usize = 16;
/// Concurrent transfers against a single location.
pub const DEFAULT_LOCATION_CONCURRENCY: usize = 4;
/// Pending files loaded from the metadata store per query.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// A backup location and the storage backend behind it.
#[derive(Clone)]
pub struct Target {
    pub location: Location,
    pub backend: BackendHandle,
    permits: Arc<Semaphore>,
}

impl Target {
    pub fn new(location: Location, backend: BackendHandle, concurrency: usize) -> Self {
        Self {
            location,
            backend,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    pub fn name(&self) -> &str {
        &self.location.name
    }
}

/// Everything the engine stages share for one run.
#[derive(Clone)]
pub struct Context {
    pub repo: Repository,
    /// Source tier the live bytes are read from; never written to.
    pub source: BackendHandle,
    /// Every configured location, including those with writes disabled
    /// (deletion still reaches them).
    pub targets: Vec<Target>,
    pub retry: RetryPolicy,
    pub transform: Arc<dyn ContentTransform>,
    pub concurrency: usize,
    pub batch_size: usize,
}

impl Context {
    /// The source backend is always wrapped read-only.
    pub fn new(repo: Repository, source: BackendHandle) -> Self {
        Self {
            repo,
            source: Arc::new(ReadOnlyBackend::new(source)),
            targets: Vec::new(),
            retry: RetryPolicy::default(),
            transform: Arc::new(Identity),
            concurrency: DEFAULT_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn ContentTransform>) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Locations new copies are written to. Each of them is required for a
    /// file to count as completely backed up.
    pub fn enabled(&self) -> impl Iterator<Item = &Target> {
        self.targets.iter().filter(|target| target.location.writes_enabled)
    }

    /// Metadata ids of the [enabled](Self::enabled) locations.
    pub fn required(&self) -> Vec<i64> {
        self.enabled().map(|target| target.location.id).collect()
    }

    pub fn target(&self, location: &str) -> Option<&Target> {
        self.targets.iter().find(|target| target.name() == location)
    }
}
