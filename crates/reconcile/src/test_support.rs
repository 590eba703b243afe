//! Fixtures shared by the engine's unit tests.

use crate::{Context, RetryPolicy, Target};
use mediabackups_media::hash::Digests;
use mediabackups_media::{FileStatus, LiveFile, WikiType};
use mediabackups_metadata::{Database, Repository};
use mediabackups_storage::BackendHandle;
use mediabackups_storage::backend::MockBackend;
use std::sync::Arc;
use time::UtcDateTime;

pub const WIKI: &str = "testwiki";
pub const PUBLIC: &str = "wikipedia-test-local-public";

pub fn at(ts: i64) -> UtcDateTime {
    UtcDateTime::from_unix_timestamp(ts).unwrap()
}

pub async fn repo() -> Repository {
    let db = Database::connect_in_memory().await.unwrap();
    let repo = Repository::open(&db).await.unwrap();
    repo.ensure_wiki(WIKI, WikiType::Public).await.unwrap();
    repo
}

/// A public file whose recorded digests match `content`.
pub fn live(name: &str, content: &[u8]) -> LiveFile {
    let digests = Digests::of(content);
    LiveFile::new(PUBLIC, format!("a/ab/{name}"), FileStatus::Public)
        .with_name(name)
        .with_sha1(digests.sha1)
        .with_md5(digests.md5)
        .with_size(content.len() as u64)
        .uploaded(at(1_600_000_000))
}

/// Source storage holding the bytes of `files`, laid out as
/// `{container}/{path}`.
pub fn source(files: &[(&LiveFile, &[u8])]) -> Arc<MockBackend> {
    Arc::new(MockBackend::with_files(
        files.iter().map(|(file, content)| (format!("{}/{}", file.container, file.path), content.to_vec())),
    ))
}

/// Context with one mock backend per `(location, writes_enabled)`.
pub async fn context(
    repo: &Repository,
    source: Arc<MockBackend>,
    locations: &[(&str, bool)],
) -> (Context, Vec<Arc<MockBackend>>) {
    let source: BackendHandle = source;
    let mut ctx = Context::new(repo.clone(), source).with_retry(RetryPolicy::immediate(2));
    let mut backends = Vec::new();
    for (name, writes_enabled) in locations {
        let location = repo.ensure_location(name, None, *writes_enabled).await.unwrap();
        let backend = Arc::new(MockBackend::default().with_name(*name));
        ctx = ctx.with_target(Target::new(location, backend.clone(), 2));
        backends.push(backend);
    }
    (ctx, backends)
}
