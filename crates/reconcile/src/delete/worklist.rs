//! Deletion worklists read from maintenance transcripts.
//!
//! Erasing archived file versions on the wiki side (`eraseArchivedFile.php
//! --delete`) prints one line per removed version. Those transcripts are
//! turned into a list of files whose backups should go too.

use exn::ResultExt;
use mediabackups_media::hash::sha1_base36_to_hex;
use mediabackups_media::{FileRecord, mwdate};
use mediabackups_metadata::{FileFilter, Repository};
use regex::Regex;
use std::sync::LazyLock;
use time::UtcDateTime;

use crate::delete::error::{ErrorKind, Result};

static COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"mwscript\s+eraseArchivedFile\.php\s+--wiki\s*=?\s*["']?([a-zA-Z0-9_-]+)["']?\s.*--delete"#).unwrap()
});
static DELETION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Deleted\sversion\s'([a-z0-9]*)\..*'\s\(([0-9]{14})\)\sof\sfile\s'(.+)'").unwrap());

/// One erased file version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorklistEntry {
    pub wiki: String,
    /// Upload name, with underscores for spaces.
    pub title: String,
    pub uploaded_at: UtcDateTime,
    /// Hexadecimal.
    pub sha1: String,
}

/// How a worklist entry maps onto tracked files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Found(FileRecord),
    Missing,
    /// Several tracked files fit; all of them are selected.
    Ambiguous(Vec<FileRecord>),
}

impl Resolution {
    pub fn files(&self) -> &[FileRecord] {
        match self {
            Self::Found(file) => std::slice::from_ref(file),
            Self::Missing => &[],
            Self::Ambiguous(files) => files,
        }
    }
}

/// Extract the erased versions from a transcript.
///
/// A deletion line applies to the wiki of the last command line seen before
/// it; deletion lines before any command, or with an unparseable timestamp
/// or digest, are skipped.
pub fn parse(transcript: &str) -> Vec<WorklistEntry> {
    let mut wiki: Option<&str> = None;
    let mut entries = Vec::new();
    for line in transcript.lines() {
        if let Some(command) = COMMAND.captures(line) {
            wiki = command.get(1).map(|m| m.as_str());
            continue;
        }
        let Some(deletion) = DELETION.captures(line) else {
            continue;
        };
        let Some(wiki) = wiki else {
            tracing::debug!(line, "Deletion outside of any erase command");
            continue;
        };
        let sha1 = match sha1_base36_to_hex(&deletion[1]) {
            Ok(sha1) => sha1,
            Err(err) => {
                tracing::error!(line, error = %err, "Bad sha1 in worklist");
                continue;
            },
        };
        let uploaded_at = match mwdate::parse_strict(&deletion[2]) {
            Ok(at) => at,
            Err(err) => {
                tracing::error!(line, error = %err, "Bad date in worklist");
                continue;
            },
        };
        entries.push(WorklistEntry {
            wiki: wiki.to_string(),
            title: deletion[3].replace(' ', "_"),
            uploaded_at,
            sha1,
        });
    }
    entries
}

/// Match each entry against the tracked files: same sha1, same upload time
/// and, where the file has one, the same upload name.
pub async fn resolve(repo: &Repository, entries: Vec<WorklistEntry>) -> Result<Vec<(WorklistEntry, Resolution)>> {
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in entries {
        let candidates = repo
            .files_matching(Some(&entry.wiki), &FileFilter::Sha1(entry.sha1.clone()))
            .await
            .or_raise(|| ErrorKind::Metadata)?;
        let mut files: Vec<FileRecord> = candidates
            .into_iter()
            .filter(|file| file.uploaded_at == Some(entry.uploaded_at))
            .filter(|file| file.upload_name.as_ref().is_none_or(|name| *name == entry.title))
            .collect();
        let resolution = match files.len() {
            0 => {
                tracing::warn!(wiki = %entry.wiki, title = %entry.title, sha1 = %entry.sha1, "No tracked file for worklist entry");
                Resolution::Missing
            },
            1 => Resolution::Found(files.remove(0)),
            _ => {
                tracing::warn!(wiki = %entry.wiki, title = %entry.title, count = files.len(), "Several tracked files for worklist entry");
                Resolution::Ambiguous(files)
            },
        };
        resolved.push((entry, resolution));
    }
    Ok(resolved)
}
