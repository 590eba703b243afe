use clap::{Args, Parser, Subcommand};
use mediabackups_media::mwdate;
use std::path::PathBuf;
use time::UtcDateTime;

/// Reconciliation, deduplication and backup of wiki media files.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Configuration file (defaults to config.yaml in the user configuration
    /// directory).
    #[arg(long, short, global = true, env = "MEDIABACKUPS_CONFIG")]
    pub config: Option<PathBuf>,
    /// Log filter, overriding the configured level (same syntax as RUST_LOG).
    #[arg(long, global = true)]
    pub log: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register the configured wikis and backup locations.
    Gather,
    /// Detect source changes and apply them to the metadata store.
    Update {
        #[command(flatten)]
        wikis: WikiArgs,
        /// Only entries changed since the latest recorded event.
        #[arg(long, conflicts_with = "since")]
        incremental: bool,
        /// Only entries changed at or after this time (YYYYMMDDHHMMSS).
        #[arg(long, value_parser = timestamp)]
        since: Option<UtcDateTime>,
    },
    /// Copy outstanding files to every location enabled for writes.
    Backup {
        #[command(flatten)]
        wikis: WikiArgs,
        /// Incremental update, then back up only the files it touched.
        #[arg(long)]
        quick: bool,
    },
    /// Delete backup copies. Without --execute nothing is deleted.
    Delete {
        #[arg(long)]
        wiki: Option<String>,
        #[command(flatten)]
        selection: DeleteArgs,
        /// Actually delete; the default is a dry run.
        #[arg(long)]
        execute: bool,
    },
    /// Find tracked files and their backup copies.
    Query {
        #[arg(long)]
        wiki: String,
        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(Debug, Args)]
pub struct WikiArgs {
    /// Restrict the run to these wikis (repeatable); defaults to the
    /// configured ones.
    #[arg(long = "wiki")]
    pub wikis: Vec<String>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct FilterArgs {
    #[arg(long)]
    pub title: Option<String>,
    /// Hexadecimal or base 36.
    #[arg(long)]
    pub sha1: Option<String>,
    #[arg(long)]
    pub sha256: Option<String>,
    /// Source location as container/path.
    #[arg(long)]
    pub path: Option<String>,
    /// Uploaded within FROM..TO (YYYYMMDDHHMMSS).
    #[arg(long, value_parser = period)]
    pub uploaded: Option<(UtcDateTime, UtcDateTime)>,
    #[arg(long, value_parser = period)]
    pub archived: Option<(UtcDateTime, UtcDateTime)>,
    #[arg(long, value_parser = period)]
    pub deleted: Option<(UtcDateTime, UtcDateTime)>,
    /// Deleted at the source before this time (retention).
    #[arg(long, value_parser = timestamp)]
    pub deleted_before: Option<UtcDateTime>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct DeleteArgs {
    /// Copies of the given content (repeatable); requires --wiki.
    #[arg(long, requires = "wiki")]
    pub sha256: Vec<String>,
    /// Copies of files whose source was deleted before this time
    /// (YYYYMMDDHHMMSS); requires --wiki.
    #[arg(long, value_parser = timestamp, requires = "wiki")]
    pub deleted_before: Option<UtcDateTime>,
    /// Copies whose deletion was started but never completed.
    #[arg(long)]
    pub pending: bool,
    /// Transcript of an eraseArchivedFile.php --delete run.
    #[arg(long)]
    pub worklist: Option<PathBuf>,
}

fn timestamp(value: &str) -> Result<UtcDateTime, String> {
    mwdate::parse_strict(value).map_err(|err| err.to_string())
}

fn period(value: &str) -> Result<(UtcDateTime, UtcDateTime), String> {
    let (from, to) = value.split_once("..").ok_or_else(|| format!("expected FROM..TO, got {value}"))?;
    let (from, to) = (timestamp(from)?, timestamp(to)?);
    if from > to {
        return Err(format!("{value} ends before it starts"));
    }
    Ok((from, to))
}
