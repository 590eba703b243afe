//! Closed enumerations stored as lookup tables in the metadata store.
//!
//! The string returned by `as_str()` is the stable identifier persisted in
//! the lookup table's name column; row ids are resolved at startup and never
//! assumed.

use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use crate::error::{Error, ErrorKind};

macro_rules! lookup_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($field:literal) {
            $($(#[$vmeta:meta])* $variant:ident => $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }
        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant,)+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $value,)+
                }
            }
        }
        impl FromStr for $name {
            type Err = Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(match s.trim() {
                    $($value => Self::$variant,)+
                    _ => exn::bail!(ErrorKind::ParseError {
                        field: $field,
                        value: s.to_string(),
                    }),
                })
            }
        }
        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
                f.write_str(self.as_str())
            }
        }
    };
}

lookup_enum! {
    /// Lifecycle status of a file on the source storage.
    FileStatus ("file_status") {
        /// Current version, publicly served.
        Public => "public",
        /// Older version of a file that has since been re-uploaded.
        Archived => "archived",
        /// Removed from public view, kept on the deleted container.
        Deleted => "deleted",
    }
}

lookup_enum! {
    /// Aggregate coverage of a file's content across required locations.
    BackupStatus ("backup_status") {
        None => "none",
        Pending => "pending",
        Complete => "complete",
        Partial => "partial",
        Failed => "failed",
    }
}

lookup_enum! {
    /// Media type as classified by the content-hosting system.
    FileType ("file_type") {
        Unknown => "UNKNOWN",
        Bitmap => "BITMAP",
        Drawing => "DRAWING",
        Audio => "AUDIO",
        Video => "VIDEO",
        Multimedia => "MULTIMEDIA",
        Office => "OFFICE",
        Text => "TEXT",
        Executable => "EXECUTABLE",
        Archive => "ARCHIVE",
        ThreeD => "3D",
        Error => "ERROR",
    }
}

lookup_enum! {
    WikiType ("wiki_type") {
        Public => "public",
        Private => "private",
        Closed => "closed",
        Deleted => "deleted",
    }
}

lookup_enum! {
    /// Source container families. Archived files share the public container.
    ContainerType ("container_type") {
        Public => "public",
        Deleted => "deleted",
    }
}

impl Default for FileType {
    fn default() -> Self {
        Self::Error
    }
}

impl ContainerType {
    pub fn for_status(status: FileStatus) -> Self {
        match status {
            FileStatus::Public | FileStatus::Archived => Self::Public,
            FileStatus::Deleted => Self::Deleted,
        }
    }
}

impl BackupStatus {
    /// Derive the aggregate status from how many required locations hold a
    /// confirmed copy. `attempted` distinguishes "never tried" from "tried
    /// and nothing stuck".
    pub fn derive(required: usize, present: usize, attempted: bool) -> Self {
        match (present, attempted) {
            (p, _) if required > 0 && p >= required => Self::Complete,
            (0, false) => Self::Pending,
            (0, true) => Self::Failed,
            _ => Self::Partial,
        }
    }
}
