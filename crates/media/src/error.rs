use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("parse error in {field}: {value}")]
    ParseError {
        field: &'static str,
        #[error(not(source))]
        value: String,
    },
    #[display("invalid {algorithm} digest: {value}")]
    InvalidDigest {
        algorithm: &'static str,
        #[error(not(source))]
        value: String,
    },
    #[display("no source container naming rule for wiki: {_0}")]
    UnknownWiki(#[error(not(source))] String),
    #[display("file name is required for {_0} files")]
    MissingName(#[error(not(source))] &'static str),
}
