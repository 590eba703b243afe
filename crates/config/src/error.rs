//! Configuration Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

/// Every configuration error aborts the run before any work starts.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// A layer could not be parsed or does not fit the expected shape.
    #[display("malformed configuration")]
    Malformed,
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
    #[display("cannot read dblist {}", _0.display())]
    Dblist(#[error(not(source))] PathBuf),
    /// Dblist expressions (`%% ...`) are only meaningful to the wiki farm
    /// tooling, never inside a plain list.
    #[display("dblist expression in {}: {_1}", _0.display())]
    DblistExpression(#[error(not(source))] PathBuf, #[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
