//! Metadata Store Error Types

use derive_more::{Display, Error};

/// A metadata store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for metadata store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The store is unavailable or rejected a statement.
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A row changed between being read and being written. Re-read the
    /// current state and try again.
    #[display("concurrent modification of {_0}")]
    Conflict(#[error(not(source))] String),
    #[display("not found: {_0}")]
    NotFound(#[error(not(source))] String),
    #[display("invalid {_0} in metadata store")]
    InvalidData(#[error(not(source))] &'static str),
    #[display("lookup table {table} has no entry for {value}")]
    MissingLookup {
        table: &'static str,
        #[error(not(source))]
        value: String,
    },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
