//! Read-only storage backend.
//!
//! Wraps the source tier: the engine reads live media from it but must
//! never modify it.

use async_trait::async_trait;
use std::path::Path;

use crate::{
    BackendHandle, StorageBackend,
    backend::{Deletion, FileInfoStream},
    error::{ErrorKind, Result},
    file::FileInfo,
};

/// Read-only storage backend.
///
/// Reads pass through to the wrapped backend; writes and deletes are refused
/// with [`PermissionDenied`](ErrorKind::PermissionDenied) and logged.
#[derive(Clone)]
pub struct ReadOnlyBackend {
    inner: BackendHandle,
}
impl ReadOnlyBackend {
    pub fn new(inner: BackendHandle) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StorageBackend for ReadOnlyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        self.inner.list_stream(prefix)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        tracing::info!(backend = self.name(), path = %path.display(), bytes = data.len(), "Refusing write to read-only storage");
        exn::bail!(ErrorKind::PermissionDenied(path.to_path_buf()))
    }

    async fn delete(&self, path: &Path) -> Result<Deletion> {
        tracing::info!(backend = self.name(), path = %path.display(), "Refusing delete on read-only storage");
        exn::bail!(ErrorKind::PermissionDenied(path.to_path_buf()))
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        self.inner.stat(path).await
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_reads_pass_through_and_writes_are_refused() {
        let inner = Arc::new(MockBackend::with_files([("a/ab/Example.jpg", b"bytes")]));
        let backend = ReadOnlyBackend::new(inner.clone());
        assert_eq!(backend.read(Path::new("a/ab/Example.jpg")).await.unwrap(), b"bytes");
        let err = backend.delete(Path::new("a/ab/Example.jpg")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::PermissionDenied(_)));
        assert!(backend.put(Path::new("other"), b"x").await.is_err());
        assert!(inner.exists(Path::new("a/ab/Example.jpg")).await.unwrap());
        assert!(!inner.exists(Path::new("other")).await.unwrap());
    }
}
