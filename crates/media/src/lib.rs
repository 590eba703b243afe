pub mod container;
pub mod error;
pub mod hash;
pub mod models;
pub mod mwdate;

pub use crate::models::{
    BackupKey, BackupRecord, BackupStatus, ContainerType, FileKey, FileRecord, FileStatus, FileType, LiveFile,
    Location, WikiType,
};
