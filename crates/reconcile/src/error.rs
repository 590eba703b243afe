//! Engine Error Types
//!
//! Every stage has its own `error` module; the kinds here only say which
//! stage failed, the causal chain lives in the `exn` frame tree.

use derive_more::{Display, Error};

/// An engine error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The run cannot start: nothing to write to, unknown location, ...
    #[display("invalid engine configuration: {_0}")]
    Configuration(#[error(not(source))] String),
    #[display("change detection failed for {_0}")]
    Detect(#[error(not(source))] String),
    #[display("metadata synchronization failed for {_0}")]
    Sync(#[error(not(source))] String),
    #[display("backup failed")]
    Backup,
    #[display("batch deletion failed")]
    Delete,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
