//! SQLite metadata store for media backups.
//!
//! Tracks the current snapshot of every media file per wiki, the append-only
//! history of how each snapshot changed, and the confirmed backup copies per
//! location. The unique key on `(location, wiki, sha256)` is the only
//! concurrency-control primitive used for deduplication: a second insert of
//! the same key reports [`InsertOutcome::AlreadyExists`] instead of failing.
//!
//! Closed enumerations (file status, backup status, ...) are stored as lookup
//! tables. Their ids are resolved once when the [`Repository`] is opened and
//! shared immutably from then on.

mod db;
pub mod error;
mod lookups;
mod models;
mod repo;

pub use crate::db::Database;
pub use crate::lookups::{Lookup, Lookups};
pub use crate::models::{ChangeKind, FileFilter, HistoryEntry, InsertOutcome};
pub use crate::repo::Repository;
