//! Command-line Error Types

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("invalid argument: {_0}")]
    Argument(#[error(not(source))] String),
    #[display("cannot open storage backend {_0}")]
    Storage(#[error(not(source))] String),
    #[display("metadata store error")]
    Metadata,
    #[display("{_0} failed")]
    Command(#[error(not(source))] &'static str),
}
