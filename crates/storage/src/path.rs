//! Object path validation.
//!
//! Every path handed to a backend is relative to that backend's root (or
//! bucket prefix) and must not be able to escape it.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates and normalizes a storage path.
///
/// Rejects `..` traversal past the root, null bytes, platform prefixes and
/// paths that normalize to nothing.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use mediabackups_storage::validate_path;
/// assert!(validate_path("commonswiki/e3b/e3b0c442").is_ok());
/// assert!(validate_path("a/../b").is_ok());
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a\0b").is_err());
/// assert_eq!(
///     validate_path("enwiki//./a/../a/ab/Example.jpg/").unwrap(),
///     Path::new("enwiki/a/ab/Example.jpg")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let original = path.as_ref();
    let invalid = || exn::Exn::from(ErrorKind::InvalidPath(original.to_path_buf()));
    let mut components = Vec::new();
    for component in original.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes survive Path::components() on Unix but truncate
                // in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    return Err(invalid());
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => return Err(invalid()),
            Component::ParentDir => {
                components.pop().ok_or_else(invalid)?;
            },
        }
    }
    match components.is_empty() {
        true => Err(invalid()),
        false => Ok(components.into_iter().collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_paths() {
        assert_eq!(validate("enwiki/e3b/e3b0c442").unwrap(), Path::new("enwiki/e3b/e3b0c442"));
        assert_eq!(validate("a/ab/Example.jpg").unwrap(), Path::new("a/ab/Example.jpg"));
        // Titles may contain characters that are not path separators.
        assert_eq!(validate("archive/a/ab/20200101000000!Example.jpg").unwrap().components().count(), 4);
    }

    #[test]
    fn test_path_normalization() {
        assert_eq!(validate("a//b//c").unwrap(), Path::new("a/b/c"));
        assert_eq!(validate("a/./b/./c").unwrap(), Path::new("a/b/c"));
        assert_eq!(validate("/rooted/path").unwrap(), Path::new("rooted/path"));
        assert_eq!(validate("a/b/..").unwrap(), Path::new("a"));
        assert_eq!(validate("wiki///").unwrap(), Path::new("wiki"));
    }

    #[test]
    fn test_traversal_attempts() {
        assert!(validate("../etc/passwd").is_err());
        assert!(validate("a/../../b").is_err());
        assert!(validate("..").is_err());
    }

    #[test]
    fn test_invalid_paths() {
        assert!(validate("a\0b").is_err());
        assert!(validate("").is_err());
        assert!(validate("./.").is_err());
        assert!(validate("//").is_err());
    }
}
