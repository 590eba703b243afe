//! Error types for the [`feed`](super) module.

use derive_more::{Display, Error};

/// A source feed error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for source feed operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies a source feed failure.
///
/// [`Timeout`](Self::Timeout) and [`Unavailable`](Self::Unavailable) are
/// transient and retried by the caller's [`RetryPolicy`](crate::RetryPolicy).
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("source feed timed out")]
    Timeout,
    #[display("source feed unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// The feed answered with something that cannot be turned into a file
    /// descriptor (or an unknown page cursor).
    #[display("invalid source feed data: {_0}")]
    Invalid(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable(_))
    }
}
