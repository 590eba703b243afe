use crate::backup::error::Result;

/// Opaque transformation applied to the source bytes before they are
/// stored (encryption for private wikis, for example).
///
/// Content identity is always the sha256 of the untransformed bytes; the
/// transform only decides what is written and under which path suffix.
pub trait ContentTransform: Send + Sync {
    /// Appended to the object path of every stored copy.
    fn suffix(&self) -> &str;

    fn apply(&self, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// Stores bytes verbatim.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ContentTransform for Identity {
    fn suffix(&self) -> &str {
        ""
    }

    fn apply(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }
}
