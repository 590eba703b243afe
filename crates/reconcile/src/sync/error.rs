//! Error types for the [`sync`](super) module.

use derive_more::{Display, Error};

/// A synchronization error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for synchronization.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies a synchronization failure.
///
/// Only [`Conflict`](Self::Conflict) is confined to a single file; the
/// others end the wiki's pass.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The file kept changing under us, even after re-reading it.
    #[display("file {_0} changed concurrently")]
    Conflict(#[error(not(source))] String),
    /// The metadata store failed.
    #[display("metadata store failed")]
    Metadata,
    /// Change detection failed; nothing after the failure was applied.
    #[display("change detection failed")]
    Detect,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
