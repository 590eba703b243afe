mod backup;
mod file;
mod location;
mod status;

pub use self::backup::{BackupKey, BackupRecord};
pub use self::file::{FileKey, FileRecord, LiveFile};
pub use self::location::Location;
pub use self::status::{BackupStatus, ContainerType, FileStatus, FileType, WikiType};
