//! Naming rules of the source object storage.
//!
//! Every wiki owns one public container (current and archived versions) and
//! one deleted container. Large wikis spread each container over shards
//! suffixed with two hash characters.

use md5::{Digest, Md5};

use crate::error::{ErrorKind, Result};
use crate::models::{ContainerType, FileStatus};

/// Database-name suffix to container project prefix.
const PROJECT_TYPES: [(&str, &str); 9] = [
    ("wiki", "wikipedia"),
    ("wikiquote", "wikiquote"),
    ("wikibooks", "wikibooks"),
    ("wikimedia", "wikimedia"),
    ("wikisource", "wikisource"),
    ("wikinews", "wikinews"),
    ("wikiversity", "wikiversity"),
    ("wikivoyage", "wikivoyage"),
    ("wiktionary", "wiktionary"),
];

const SHARDED_WIKIS: [&str; 16] = [
    "commonswiki",
    "dewiki",
    "enwiki",
    "fiwiki",
    "frwiki",
    "hewiki",
    "huwiki",
    "idwiki",
    "itwiki",
    "jawiki",
    "rowiki",
    "ruwiki",
    "thwiki",
    "trwiki",
    "ukwiki",
    "zhwiki",
];

pub const BASE16_CHARACTERS: &str = "0123456789abcdef";
pub const BASE36_CHARACTERS: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

pub fn is_sharded(wiki: &str) -> bool {
    SHARDED_WIKIS.contains(&wiki)
}

/// Base container name (without shard suffix) of a wiki.
pub fn container_name(wiki: &str, container_type: ContainerType) -> Result<String> {
    let (suffix, project) = PROJECT_TYPES
        .iter()
        .find(|(suffix, _)| wiki.ends_with(suffix))
        .ok_or_else(|| exn::Exn::from(ErrorKind::UnknownWiki(wiki.to_string())))?;
    let language = wiki[..wiki.len() - suffix.len()].replace('_', "-");
    Ok(format!("{project}-{language}-local-{container_type}"))
}

/// Every container (shards included) that may hold files of the given type.
pub fn containers(wiki: &str, container_type: ContainerType) -> Result<Vec<String>> {
    let base = container_name(wiki, container_type)?;
    if !is_sharded(wiki) {
        return Ok(vec![base]);
    }
    let base = base.as_str();
    let alphabet = match container_type {
        ContainerType::Public => BASE16_CHARACTERS,
        ContainerType::Deleted => BASE36_CHARACTERS,
    };
    Ok(alphabet
        .chars()
        .flat_map(|first| alphabet.chars().map(move |second| format!("{base}.{first}{second}")))
        .collect())
}

/// Inverse of [`container_name`], tolerating shard suffixes.
pub fn wiki_name(container: &str) -> Option<String> {
    let base = container.split('.').next()?;
    let base = ["-local-public", "-local-deleted"]
        .iter()
        .find_map(|postfix| base.strip_suffix(postfix))
        .unwrap_or(base);
    PROJECT_TYPES.iter().find_map(|(suffix, project)| {
        let language = base.strip_prefix(project)?.strip_prefix('-')?;
        Some(format!("{}{suffix}", language.replace('-', "_")))
    })
}

/// Source container and path of a file.
///
/// `storage_name` is the name of the object in the container: the title for
/// current versions, `{timestamp}!{title}` for archived ones and the base 36
/// sha1 plus extension for deleted ones.
pub fn source_location(
    wiki: &str,
    title: Option<&str>,
    status: FileStatus,
    storage_name: &str,
) -> Result<(String, String)> {
    let mut container = container_name(wiki, ContainerType::for_status(status))?;
    let invalid = || {
        exn::Exn::from(ErrorKind::ParseError {
            field: "storage_name",
            value: storage_name.to_string(),
        })
    };
    let shard = match status {
        FileStatus::Deleted => {
            if !storage_name.get(..3).is_some_and(|head| head.bytes().all(|b| b.is_ascii_alphanumeric())) {
                return Err(invalid());
            }
            storage_name.to_string()
        },
        _ => {
            let title = title.ok_or_else(|| exn::Exn::from(ErrorKind::MissingName(status.as_str())))?;
            hex::encode(Md5::digest(title.as_bytes()))
        },
    };
    if is_sharded(wiki) {
        container = format!("{container}.{}", &shard[..2]);
    }
    let path = match status {
        FileStatus::Public => format!("{}/{}/{storage_name}", &shard[..1], &shard[..2]),
        FileStatus::Archived => format!("archive/{}/{}/{storage_name}", &shard[..1], &shard[..2]),
        FileStatus::Deleted => format!("{}/{}/{}/{storage_name}", &shard[..1], &shard[1..2], &shard[2..3]),
    };
    Ok((container, path))
}
