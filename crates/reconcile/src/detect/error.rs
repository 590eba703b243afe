//! Error types for the [`detect`](super) module.

use derive_more::{Display, Error};

/// A change detection error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for change detection.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The source feed kept timing out after every retry. A later run may
    /// succeed; other wikis are unaffected.
    #[display("source feed for {_0} is temporarily unavailable")]
    TransientFeed(#[error(not(source))] String),
    /// The source feed answered with something unusable.
    #[display("source feed for {_0} failed")]
    Feed(#[error(not(source))] String),
    /// Reading the tracked snapshots failed.
    #[display("metadata store failed")]
    Metadata,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFeed(_))
    }
}
