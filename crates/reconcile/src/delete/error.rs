//! Error types for the [`delete`](super) module.

use derive_more::{Display, Error};

/// A deletion error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for deletion.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies a deletion failure.
///
/// Everything but [`Metadata`](Self::Metadata) is confined to one item,
/// which stays deletion-pending for a later run.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A file that is not deleted at the source still has this content.
    #[display("content {sha256} is still used by live file {file_id}")]
    InUse {
        #[error(not(source))]
        sha256: String,
        file_id: i64,
    },
    #[display("location {_0} is not configured")]
    UnknownLocation(#[error(not(source))] String),
    #[display("delete from {_0} failed")]
    RemoteDelete(#[error(not(source))] String),
    #[display("metadata store failed")]
    Metadata,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteDelete(_))
    }
}
