//! Error types for the [`backup`](super) module.

use derive_more::{Display, Error};

/// A backup error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies a backup failure.
///
/// ### Per-file errors
/// - [`ErrorKind::IntegrityMismatch`]
/// - [`ErrorKind::SourceRead`]
/// - [`ErrorKind::Superseded`]
///
/// ### Per-location errors
/// - [`ErrorKind::RemoteWrite`]
/// - [`ErrorKind::Transform`]
///
/// ### Run-level errors
/// - [`ErrorKind::NoLocations`]
/// - [`ErrorKind::Metadata`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The source bytes do not hash to what was recorded for the file.
    #[display("{algorithm} mismatch: recorded {expected}, computed {actual}")]
    IntegrityMismatch {
        algorithm: &'static str,
        #[error(not(source))]
        expected: String,
        #[error(not(source))]
        actual: String,
    },
    #[display("cannot read source object {_0}")]
    SourceRead(#[error(not(source))] String),
    /// The file's content changed while its bytes were being hashed.
    #[display("file {_0} was replaced during the backup")]
    Superseded(#[error(not(source))] i64),
    #[display("write to {_0} failed")]
    RemoteWrite(#[error(not(source))] String),
    #[display("content transform failed")]
    Transform,
    #[display("no location is enabled for writes")]
    NoLocations,
    #[display("metadata store failed")]
    Metadata,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceRead(_) | Self::RemoteWrite(_))
    }
}
