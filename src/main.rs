mod cli;
mod error;
mod setup;

use crate::cli::{Cli, Command, DeleteArgs, FilterArgs};
use crate::error::{ErrorKind, Result};
use clap::Parser;
use exn::ResultExt;
use mediabackups_config::Config;
use mediabackups_media::hash::sha1_base36_to_hex;
use mediabackups_media::{WikiType, mwdate};
use mediabackups_metadata::{FileFilter, Repository};
use mediabackups_reconcile::delete::{self, DeleteMode, ItemResult, Selection, worklist};
use mediabackups_reconcile::detect::ScanMode;
use mediabackups_reconcile::{Reconciler, WikiSummary};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref());
    let level = config.as_ref().map(|config| config.log_level.clone()).unwrap_or_else(|_| "info".to_string());
    let filter = match &cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let result = match config {
        Ok(config) => run(cli.command, config).await,
        Err(err) => Err(err).or_raise(|| ErrorKind::Config),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = ?err, "Aborted");
            ExitCode::FAILURE
        },
    }
}

async fn run(command: Command, config: Config) -> Result<ExitCode> {
    let repo = setup::repository(&config).await?;
    let reconciler = setup::reconciler(&config, repo.clone()).await?;
    match command {
        Command::Gather => gather(&config, &reconciler).await,
        Command::Update {
            wikis,
            incremental,
            since,
        } => {
            let mode = match (incremental, since) {
                (_, Some(since)) => ScanMode::Since(since),
                (true, None) => ScanMode::Incremental,
                (false, None) => ScanMode::Full,
            };
            let wikis = selected(&config, wikis.wikis)?;
            Ok(report(&reconciler.update(&wikis, mode).await))
        },
        Command::Backup { wikis, quick } => {
            let wikis = selected(&config, wikis.wikis)?;
            let summaries = match quick {
                true => reconciler.quick_backup(&wikis).await,
                false => reconciler.backup(&wikis).await,
            }
            .or_raise(|| ErrorKind::Command("backup"))?;
            Ok(report(&summaries))
        },
        Command::Delete {
            wiki,
            selection,
            execute,
        } => {
            let mode = match execute {
                true => DeleteMode::Execute,
                false => DeleteMode::DryRun,
            };
            let selection = deletion(wiki, selection)?;
            let result = delete::delete(reconciler.context(), &selection, mode)
                .await
                .or_raise(|| ErrorKind::Command("delete"))?;
            for (key, outcome) in &result.items {
                match outcome {
                    ItemResult::Reported => println!("would delete\t{key}"),
                    ItemResult::Deleted => println!("deleted\t{key}"),
                    ItemResult::Failed(reason) => println!("failed\t{key}\t{reason}"),
                }
            }
            Ok(match result.failed() {
                0 => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            })
        },
        Command::Query { wiki, filter } => query(&repo, &wiki, filter).await,
    }
}

/// Register the configured wikis, typed by the private and closed dblists.
async fn gather(config: &Config, reconciler: &Reconciler) -> Result<ExitCode> {
    let wikis = config.wikis.resolve().or_raise(|| ErrorKind::Config)?;
    let private = config.wikis.private().or_raise(|| ErrorKind::Config)?;
    let closed = config.wikis.closed().or_raise(|| ErrorKind::Config)?;
    let typed: Vec<(String, WikiType)> = wikis
        .into_iter()
        .map(|wiki| {
            let wiki_type = if private.contains(&wiki) {
                WikiType::Private
            } else if closed.contains(&wiki) {
                WikiType::Closed
            } else {
                WikiType::Public
            };
            (wiki, wiki_type)
        })
        .collect();
    reconciler.register(&typed).await.or_raise(|| ErrorKind::Command("gather"))?;
    tracing::info!(
        wikis = typed.len(),
        locations = reconciler.context().targets.len(),
        "Registered"
    );
    Ok(ExitCode::SUCCESS)
}

fn selected(config: &Config, explicit: Vec<String>) -> Result<Vec<String>> {
    if !explicit.is_empty() {
        return Ok(explicit);
    }
    let wikis = config.wikis.resolve().or_raise(|| ErrorKind::Config)?;
    if wikis.is_empty() {
        exn::bail!(ErrorKind::Argument("no wiki given or configured".to_string()));
    }
    Ok(wikis)
}

fn deletion(wiki: Option<String>, args: DeleteArgs) -> Result<Selection> {
    if let Some(path) = args.worklist {
        let transcript = std::fs::read_to_string(&path)
            .or_raise(|| ErrorKind::Argument(format!("cannot read worklist {}", path.display())))?;
        return Ok(Selection::Worklist(worklist::parse(&transcript)));
    }
    if args.pending {
        return Ok(Selection::PendingDeletion { wiki });
    }
    let wiki = wiki.ok_or_else(|| exn::Exn::from(ErrorKind::Argument("--wiki is required".to_string())))?;
    Ok(match args.deleted_before {
        Some(before) => Selection::Files {
            wiki,
            filter: FileFilter::DeletedBefore(before),
        },
        None => Selection::Content {
            wiki,
            sha256s: args.sha256,
        },
    })
}

fn filter(args: FilterArgs) -> Result<FileFilter> {
    Ok(if let Some(title) = args.title {
        FileFilter::Title(title.replace(' ', "_"))
    } else if let Some(sha1) = args.sha1 {
        match sha1.len() {
            40 => FileFilter::Sha1(sha1),
            _ => FileFilter::Sha1(sha1_base36_to_hex(&sha1).or_raise(|| ErrorKind::Argument(sha1.clone()))?),
        }
    } else if let Some(sha256) = args.sha256 {
        FileFilter::Sha256(sha256)
    } else if let Some(path) = args.path {
        let (container, path) = path
            .split_once('/')
            .ok_or_else(|| exn::Exn::from(ErrorKind::Argument(format!("expected container/path, got {path}"))))?;
        FileFilter::SourcePath {
            container: container.to_string(),
            path: path.to_string(),
        }
    } else if let Some((from, to)) = args.uploaded {
        FileFilter::UploadedBetween(from, to)
    } else if let Some((from, to)) = args.archived {
        FileFilter::ArchivedBetween(from, to)
    } else if let Some((from, to)) = args.deleted {
        FileFilter::DeletedBetween(from, to)
    } else if let Some(before) = args.deleted_before {
        FileFilter::DeletedBefore(before)
    } else {
        exn::bail!(ErrorKind::Argument("no filter given".to_string()));
    })
}

async fn query(repo: &Repository, wiki: &str, args: FilterArgs) -> Result<ExitCode> {
    let files = repo
        .files_matching(Some(wiki), &filter(args)?)
        .await
        .or_raise(|| ErrorKind::Metadata)?;
    let show = |at: Option<time::UtcDateTime>| at.map(mwdate::format).unwrap_or_else(|| "-".to_string());
    for file in &files {
        println!(
            "{}\t{}/{}\t{}\t{}\tuploaded {}\tsha1 {}\tsha256 {}\tbackup {}",
            file.id,
            file.container,
            file.path,
            file.upload_name.as_deref().unwrap_or("-"),
            file.status,
            show(file.uploaded_at),
            file.sha1.as_deref().unwrap_or("-"),
            file.sha256.as_deref().unwrap_or("-"),
            file.backup_status,
        );
        let Some(sha256) = &file.sha256 else {
            continue;
        };
        let copies = repo.backups_for_content(wiki, sha256).await.or_raise(|| ErrorKind::Metadata)?;
        for copy in copies {
            println!("\t{}\t{}\tconfirmed {}", copy.key.location, copy.path, mwdate::format(copy.confirmed_at));
        }
    }
    Ok(match files.is_empty() {
        true => ExitCode::FAILURE,
        false => ExitCode::SUCCESS,
    })
}

/// Log one line per wiki; any wiki with failures fails the run.
fn report(summaries: &[WikiSummary]) -> ExitCode {
    for summary in summaries {
        let sync = summary.sync.as_ref();
        tracing::info!(
            wiki = %summary.wiki,
            created = sync.map(|report| report.created),
            updated = sync.map(|report| report.updated),
            deleted = sync.map(|report| report.deleted),
            complete = summary.complete,
            partial = summary.partial,
            failed = summary.failed,
            "Summary"
        );
    }
    match summaries.iter().all(WikiSummary::is_ok) {
        true => ExitCode::SUCCESS,
        false => ExitCode::FAILURE,
    }
}
