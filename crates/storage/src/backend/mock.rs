//! In-memory storage backend for testing.

use super::{Deletion, FileInfoStream};
use crate::error::{ErrorKind, Result};
use crate::file::FileInfo;
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use time::UtcDateTime;
use tokio::sync::RwLock;

use crate::StorageBackend;

/// Backend operations that can be observed and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Delete,
}

/// In-memory storage backend for testing.
///
/// Objects live in a `HashMap` behind a [`RwLock`]. Every read, write and
/// delete is recorded, and any of them can be switched to fail with a
/// network error; writes can also be silently dropped to exercise write
/// confirmation.
///
/// # Examples
///
/// ```
/// use mediabackups_storage::backend::{MockBackend, Operation, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([("a/ab/Example.jpg", b"bytes")]);
/// assert!(backend.exists(Path::new("a/ab/Example.jpg")).await?);
///
/// backend.set_failing(Operation::Write, true);
/// assert!(backend.write(Path::new("new"), b"data").await.is_err());
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, (UtcDateTime, Vec<u8>)>>,
    failing: Mutex<HashSet<Operation>>,
    lose_writes: Mutex<bool>,
    calls: Mutex<Vec<(Operation, PathBuf)>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with objects.
    ///
    /// Panics if any path fails validation: broken test setup should not
    /// produce a passing test.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let now = UtcDateTime::now();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, (now, data.into()));
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            failing: Mutex::new(HashSet::new()),
            lose_writes: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Make every subsequent call of `operation` fail (or succeed again).
    pub fn set_failing(&self, operation: Operation, failing: bool) {
        let mut guard = self.failing.lock().unwrap_or_else(|e| e.into_inner());
        match failing {
            true => guard.insert(operation),
            false => guard.remove(&operation),
        };
    }

    /// Accept writes without storing them.
    pub fn set_losing_writes(&self, lose: bool) {
        *self.lose_writes.lock().unwrap_or_else(|e| e.into_inner()) = lose;
    }

    /// Paths passed to `operation`, in call order.
    pub fn calls(&self, operation: Operation) -> Vec<PathBuf> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(op, _)| *op == operation)
            .map(|(_, path)| path.clone())
            .collect()
    }

    /// Snapshot of stored object paths.
    pub async fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.storage.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn record(&self, operation: Operation, path: &Path) -> Result<()> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push((operation, path.to_path_buf()));
        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(&operation) {
            exn::bail!(ErrorKind::Network(format!("injected {operation:?} failure on {}", path.display())));
        }
        Ok(())
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot under the read lock; never hold it across a yield.
            let entries: Vec<FileInfo> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(path, _)| validated_prefix.as_ref().is_none_or(|pfx| path.starts_with(pfx)))
                    .map(|(path, (inserted, data))| Self::file_info(path, *inserted, data))
                    .collect()
            };
            for info in entries {
                yield Ok(info);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        self.record(Operation::Read, &path)?;
        let (_inserted, data) =
            self.storage.read().await.get(&path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))?;
        Ok(data)
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        self.record(Operation::Write, &path)?;
        if *self.lose_writes.lock().unwrap_or_else(|e| e.into_inner()) {
            return Ok(());
        }
        self.storage.write().await.insert(path, (UtcDateTime::now(), data.to_vec()));
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<Deletion> {
        let path = validate_path(path)?;
        self.record(Operation::Delete, &path)?;
        Ok(match self.storage.write().await.remove(&path) {
            Some(_) => Deletion::Confirmed,
            None => Deletion::AlreadyAbsent,
        })
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let guard = self.storage.read().await;
        let (inserted, data) = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(Self::file_info(&path, *inserted, data))
    }
}
impl MockBackend {
    fn file_info(path: &Path, inserted: UtcDateTime, data: &[u8]) -> FileInfo {
        FileInfo::new(path, data.len() as u64, inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_read() {
        let backend = MockBackend::default();
        backend.put(Path::new("enwiki/abc/abcdef"), b"hello").await.unwrap();
        assert_eq!(backend.read(Path::new("enwiki/abc/abcdef")).await.unwrap(), b"hello");
        assert_eq!(backend.calls(Operation::Write), vec![PathBuf::from("enwiki/abc/abcdef")]);
    }

    #[tokio::test]
    async fn test_lost_write_is_not_confirmed() {
        let backend = MockBackend::default();
        backend.set_losing_writes(true);
        let err = backend.put(Path::new("file"), b"data").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unconfirmed(_)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = MockBackend::with_files([("file", b"data")]);
        backend.set_failing(Operation::Delete, true);
        let err = backend.delete(Path::new("file")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(backend.exists(Path::new("file")).await.unwrap());
        backend.set_failing(Operation::Delete, false);
        assert_eq!(backend.delete(Path::new("file")).await.unwrap(), Deletion::Confirmed);
        assert_eq!(backend.delete(Path::new("file")).await.unwrap(), Deletion::AlreadyAbsent);
        assert_eq!(backend.calls(Operation::Delete).len(), 3);
    }

    #[tokio::test]
    async fn test_list_with_prefix() {
        let backend = MockBackend::with_files([
            ("enwiki/abc/one", Vec::from(*b"a")),
            ("enwiki/abd/two", Vec::from(*b"b")),
            ("dewiki/abc/three", Vec::from(*b"c")),
        ]);
        assert_eq!(backend.list(Some(Path::new("enwiki"))).await.unwrap().len(), 2);
        assert_eq!(backend.list(None).await.unwrap().len(), 3);
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
