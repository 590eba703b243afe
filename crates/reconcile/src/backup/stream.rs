use crate::Context;
use crate::backup::error::{ErrorKind, Result};
use crate::backup::{BackupReport, backup_file};
use crate::error::{ErrorKind as EngineErrorKind, Result as EngineResult};
use async_stream::stream;
use exn::ResultExt;
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use mediabackups_media::{BackupStatus, FileRecord};

/// Backup statuses a run always picks up. `complete` files are picked up
/// too when an enabled location holds no copy of their content.
const OUTSTANDING: [BackupStatus; 3] = [BackupStatus::Pending, BackupStatus::Partial, BackupStatus::Failed];

/// Progress events emitted by [`backup`] and [`backup_files`].
///
/// Events follow a strict ordering:
/// 1. [`Started`](Self::Started) exactly once.
/// 2. [`DiscoveryComplete`](Self::DiscoveryComplete) exactly once, with the
///    number of files to back up.
/// 3. [`BackedUp`](Self::BackedUp) zero or more times, one per file.
/// 4. [`Complete`](Self::Complete) exactly once.
///
/// A discovery failure terminates the stream early, in which case
/// [`Complete`](Self::Complete) is never emitted.
#[derive(Debug)]
pub enum BackupEvent {
    Started,
    DiscoveryComplete(u64),
    BackedUp(BackupReport),
    Complete,
}

/// Streams [`BackupEvent`]s while backing up every file of `wiki` that is
/// not yet completely backed up.
///
/// Files are backed up concurrently, up to [`Context::concurrency`] at a
/// time. Individual file failures are surfaced as `Err` items without
/// terminating the stream; only a metadata failure during discovery is
/// fatal.
pub fn backup<'a>(ctx: &'a Context, wiki: &'a str) -> impl Stream<Item = EngineResult<BackupEvent>> + 'a {
    stream! {
        for await event in run(ctx, outstanding(ctx, wiki)) {
            yield event.or_raise(|| EngineErrorKind::Backup);
        }
    }
}

/// Like [`backup`], restricted to the given file ids (the files a
/// synchronization pass just created or updated). Files already completely
/// backed up are skipped.
pub fn backup_files<'a>(ctx: &'a Context, ids: &'a [i64]) -> impl Stream<Item = EngineResult<BackupEvent>> + 'a {
    stream! {
        for await event in run(ctx, selected(ctx, ids)) {
            yield event.or_raise(|| EngineErrorKind::Backup);
        }
    }
}

/// Walk the outstanding files of a wiki in id order, one batch at a time.
async fn outstanding(ctx: &Context, wiki: &str) -> Result<Vec<FileRecord>> {
    let required = ctx.required();
    let mut files = Vec::new();
    let mut after_id = 0;
    loop {
        let batch = ctx
            .repo
            .files_needing_backup(wiki, &OUTSTANDING, &required, after_id, ctx.batch_size)
            .await
            .or_raise(|| ErrorKind::Metadata)?;
        let Some(last) = batch.last() else {
            break;
        };
        after_id = last.id;
        let exhausted = batch.len() < ctx.batch_size;
        files.extend(batch);
        if exhausted {
            break;
        }
    }
    Ok(files)
}

async fn selected(ctx: &Context, ids: &[i64]) -> Result<Vec<FileRecord>> {
    ctx.repo
        .files_needing_backup_among(ids, &OUTSTANDING, &ctx.required())
        .await
        .or_raise(|| ErrorKind::Metadata)
}

fn run<'a>(
    ctx: &'a Context,
    discovery: impl Future<Output = Result<Vec<FileRecord>>> + 'a,
) -> impl Stream<Item = Result<BackupEvent>> + 'a {
    stream!({
        yield Ok(BackupEvent::Started);

        let files = match discovery.await {
            Ok(files) => files,
            Err(err) => {
                yield Err(err);
                return;
            },
        };
        yield Ok(BackupEvent::DiscoveryComplete(u64::try_from(files.len()).unwrap_or(u64::MAX)));

        let mut futures: Vec<_> = files
            .into_iter()
            .map(move |file| async move { backup_file(ctx, &file).await })
            .collect();
        let mut processing = FuturesUnordered::new();
        processing.extend(futures.drain(..ctx.concurrency.min(futures.len())));
        while let Some(result) = processing.next().await {
            yield result.map(BackupEvent::BackedUp);
            // Pop-n-push, but FIFO instead of LIFO.
            if !futures.is_empty() {
                processing.push(futures.remove(0));
            }
        }

        yield Ok(BackupEvent::Complete);
    })
}
