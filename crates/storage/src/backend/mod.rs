//! Storage backend trait and implementations.
//!
//! A [`StorageBackend`] is one location's view of an object store: the
//! source tier the live media is read from, or one of the backup
//! locations copies are written to.

mod local;
#[cfg(feature = "mock")]
mod mock;
mod ro;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::{MockBackend, Operation};
pub use self::ro::ReadOnlyBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

type FileInfoStream<'a> = Pin<Box<dyn Stream<Item = Result<FileInfo>> + Send + 'a>>;

/// Outcome of a successful delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    /// The object existed and the backend confirmed its removal.
    Confirmed,
    /// There was nothing to delete.
    AlreadyAbsent,
}

/// Unified interface for object storage.
///
/// All paths are relative to the storage root and are validated with
/// [`validate_path`](crate::validate_path) by every implementation.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use mediabackups_storage::{backend::StorageBackend, error::Result};
///
/// async fn copy_object(from: &dyn StorageBackend, to: &dyn StorageBackend, path: &Path) -> Result<u64> {
///     let data = from.read(path).await?;
///     let confirmed = to.put(path, &data).await?;
///     Ok(confirmed.size)
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend, used for logging.
    fn name(&self) -> &str;

    /// List all objects matching an optional prefix.
    ///
    /// Collects [`list_stream()`](Self::list_stream) into a [`Vec`].
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<FileInfo>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream object metadata matching an optional prefix.
    ///
    /// Listing a prefix that does not exist yields nothing rather than an
    /// error, whatever the backend.
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// # use mediabackups_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream(None);
    /// while let Some(info) = stream.try_next().await? {
    ///     println!("{}: {} bytes", info.path.display(), info.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read an object's contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Write an object, creating or overwriting it.
    ///
    /// A successful return only means the request was accepted. Use
    /// [`put()`](Self::put) when the write must be confirmed.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Delete an object.
    ///
    /// Deleting an object that does not exist is not an error, it reports
    /// [`Deletion::AlreadyAbsent`].
    async fn delete(&self, path: &Path) -> Result<Deletion>;

    /// Stat an object.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the object
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Write an object and wait for the destination to echo it back.
    ///
    /// The write is only trusted once a subsequent [`stat()`](Self::stat)
    /// reports the object with the expected size; anything else is
    /// [`Unconfirmed`](crate::error::ErrorKind::Unconfirmed).
    async fn put(&self, path: &Path, data: &[u8]) -> Result<FileInfo> {
        self.write(path, data).await?;
        match self.stat(path).await {
            Ok(info) if info.size == data.len() as u64 => Ok(info),
            Ok(info) => {
                tracing::warn!(
                    backend = self.name(),
                    path = %path.display(),
                    expected = data.len(),
                    actual = info.size,
                    "Written object size does not match"
                );
                exn::bail!(ErrorKind::Unconfirmed(path.to_path_buf()))
            },
            Err(err) if matches!(&*err, ErrorKind::NotFound(_)) => {
                exn::bail!(ErrorKind::Unconfirmed(path.to_path_buf()))
            },
            Err(err) => Err(err),
        }
    }
}
