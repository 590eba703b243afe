//! Source feed derived from listing the source containers themselves.
//!
//! Each page is one container: the public ones (current and archived
//! versions) first, then the deleted ones. Descriptors are reconstructed
//! from object paths:
//!
//! - public: `a/ab/{name}`
//! - archived: `archive/a/ab/{YYYYMMDDHHMMSS}!{name}`
//! - deleted: `a/b/c/{sha1 base 36}.{extension}`

use super::{Page, Presence, SourceFeed};
use crate::feed::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use mediabackups_media::{ContainerType, FileKey, FileStatus, FileType, LiveFile, container, hash, mwdate};
use mediabackups_storage::{BackendHandle, FileInfo};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use time::UtcDateTime;

static PUBLIC_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-f])/([0-9a-f]{2})/([^/]+)$").unwrap());
static ARCHIVED_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^archive/([0-9a-f])/([0-9a-f]{2})/(\d{14})!([^/]+)$").unwrap());
static DELETED_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9a-z])/([0-9a-z])/([0-9a-z])/([0-9a-z]{31})(?:\.([^/.]+))?$").unwrap());

/// Media type guessed from a file extension.
fn file_type(extension: Option<&str>) -> FileType {
    let Some(extension) = extension else {
        return FileType::Unknown;
    };
    match extension.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "tif" | "tiff" | "webp" | "xcf" | "bmp" => FileType::Bitmap,
        "svg" => FileType::Drawing,
        "ogg" | "oga" | "opus" | "flac" | "wav" | "mp3" | "mid" => FileType::Audio,
        "ogv" | "webm" | "mpg" | "mpeg" => FileType::Video,
        "pdf" | "djvu" => FileType::Office,
        "stl" => FileType::ThreeD,
        _ => FileType::Unknown,
    }
}

fn extension(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(_, extension)| extension)
}

/// Rebuild a descriptor from an object path relative to its container.
///
/// Returns `None` for objects that do not follow the container layout.
fn describe(container: &str, info: &FileInfo, relative: &str, container_type: ContainerType) -> Option<LiveFile> {
    let base = LiveFile::new(container, relative, FileStatus::Public).with_size(info.size);
    let base = match &info.md5 {
        Some(md5) => base.with_md5(md5),
        None => base,
    };
    match container_type {
        ContainerType::Public => {
            if let Some(captures) = PUBLIC_PATH.captures(relative) {
                if !captures[2].starts_with(&captures[1]) {
                    return None;
                }
                let name = &captures[3];
                return Some(base.with_name(name).with_type(file_type(extension(name))).uploaded(info.modified));
            }
            let captures = ARCHIVED_PATH.captures(relative)?;
            if !captures[2].starts_with(&captures[1]) {
                return None;
            }
            let name = &captures[4];
            let archived_at = mwdate::parse_strict(&captures[3]).ok()?;
            Some(LiveFile {
                status: FileStatus::Archived,
                ..base.with_name(name).with_type(file_type(extension(name))).archived(archived_at)
            })
        },
        ContainerType::Deleted => {
            let captures = DELETED_PATH.captures(relative)?;
            let sha1 = &captures[4];
            if !sha1.starts_with(&format!("{}{}{}", &captures[1], &captures[2], &captures[3])) {
                return None;
            }
            let sha1 = hash::sha1_base36_to_hex(sha1).ok()?;
            let file_type = file_type(captures.get(5).map(|ext| ext.as_str()));
            Some(LiveFile {
                status: FileStatus::Deleted,
                ..base.with_sha1(sha1).with_type(file_type).deleted(info.modified)
            })
        },
    }
}

/// A [`SourceFeed`] over the source object storage.
///
/// The backend is expected to be the read-only source tier, with objects
/// stored as `{container}/{path}`.
pub struct ContainerFeed {
    source: BackendHandle,
}

impl ContainerFeed {
    pub fn new(source: BackendHandle) -> Self {
        Self { source }
    }

    fn containers(wiki: &str) -> Result<Vec<(String, ContainerType)>> {
        let mut all = Vec::new();
        for container_type in [ContainerType::Public, ContainerType::Deleted] {
            let names = container::containers(wiki, container_type)
                .or_raise(|| ErrorKind::Invalid(format!("no source containers for {wiki}")))?;
            all.extend(names.into_iter().map(|name| (name, container_type)));
        }
        Ok(all)
    }
}

fn storage_failure<T>(result: mediabackups_storage::error::Result<T>, what: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err) if err.is_retryable() => Err(err).or_raise(|| ErrorKind::Unavailable(what.to_string())),
        Err(err) => Err(err).or_raise(|| ErrorKind::Invalid(what.to_string())),
    }
}

#[async_trait]
impl SourceFeed for ContainerFeed {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_page(&self, wiki: &str, since: Option<UtcDateTime>, cursor: Option<&str>) -> Result<Page> {
        let containers = Self::containers(wiki)?;
        let index = match cursor {
            None => 0,
            Some(cursor) => cursor
                .parse::<usize>()
                .ok()
                .filter(|index| *index < containers.len())
                .ok_or_raise(|| ErrorKind::Invalid(format!("unknown cursor {cursor}")))?,
        };
        let (name, container_type) = &containers[index];
        let listing = storage_failure(self.source.list(Some(Path::new(name))).await, name)?;

        let mut files = Vec::with_capacity(listing.len());
        for info in &listing {
            let relative = info.path.strip_prefix(name).ok().and_then(|path| path.to_str());
            let Some(file) = relative.and_then(|relative| describe(name, info, relative, *container_type)) else {
                tracing::warn!(container = %name, path = %info.path.display(), "Ignoring object outside the container layout");
                continue;
            };
            if since.is_none_or(|since| file.last_event().is_some_and(|at| at >= since)) {
                files.push(file);
            }
        }
        tracing::debug!(container = %name, objects = listing.len(), files = files.len(), "Listed source container");
        Ok(Page {
            files,
            next: (index + 1 < containers.len()).then(|| (index + 1).to_string()),
        })
    }

    async fn presence(&self, _wiki: &str, key: &FileKey) -> Result<Presence> {
        let path = Path::new(&key.container).join(&key.path);
        let exists = storage_failure(self.source.exists(&path).await, &key.path)?;
        Ok(match exists {
            true => Presence::Live,
            false => Presence::Removed(None),
        })
    }
}
