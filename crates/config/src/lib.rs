//! Layered configuration for mediabackups.
//!
//! Values are merged from, in increasing priority:
//!
//! 1. built-in defaults;
//! 2. a configuration file, `config.yaml` in the user's configuration
//!    directory unless a path is given (`.toml` and `.json` files are read
//!    according to their extension);
//! 3. `MEDIABACKUPS_` prefixed environment variables, with `__` separating
//!    nested keys (`MEDIABACKUPS_BACKUP__CONCURRENCY=8`).
//!
//! The merged configuration is validated before it is returned.

mod dblist;
pub mod error;

pub use crate::dblist::{parse_dblist, read_dblist};
use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "MEDIABACKUPS_";
const DEFAULT_FILE: &str = "config.yaml";

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "mediabackups")
}

/// Where the configuration file is looked for when no path is given.
pub fn default_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(DEFAULT_FILE))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        let path = match project_dirs() {
            Some(dirs) => dirs.data_dir().join("metadata.sqlite"),
            None => PathBuf::from("mediabackups.sqlite"),
        };
        Self { path }
    }
}

/// An object store, selected by its `backend` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum BackendConfig {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: Option<String>,
        #[serde(default = "default_region")]
        region: String,
        #[serde(default)]
        endpoint: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl BackendConfig {
    /// Human-readable address of the store, recorded with each location.
    pub fn endpoint(&self) -> String {
        match self {
            Self::Local { root } => root.display().to_string(),
            Self::S3 {
                bucket,
                endpoint: Some(endpoint),
                ..
            } => format!("{endpoint}/{bucket}"),
            Self::S3 { bucket, .. } => format!("s3://{bucket}"),
        }
    }
}

/// A backup location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationConfig {
    #[serde(flatten)]
    pub backend: BackendConfig,
    /// Locations with writes disabled receive no new copies and are not
    /// required for a complete backup; deletion still reaches them.
    #[serde(default = "enabled")]
    pub writes_enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Pending files loaded per metadata query.
    pub batch_size: usize,
    /// Files backed up at the same time.
    pub concurrency: usize,
    /// Concurrent transfers against one location.
    pub per_location_concurrency: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            concurrency: 16,
            per_location_concurrency: 4,
        }
    }
}

/// Which wikis a run covers, and how they are classified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WikiConfig {
    #[serde(default)]
    pub list: Vec<String>,
    /// Dblist file adding to `list`.
    #[serde(default)]
    pub dblist: Option<PathBuf>,
    #[serde(default)]
    pub private_dblist: Option<PathBuf>,
    #[serde(default)]
    pub closed_dblist: Option<PathBuf>,
}

impl WikiConfig {
    /// Configured wikis in order of appearance, without duplicates.
    pub fn resolve(&self) -> Result<Vec<String>> {
        let mut wikis = self.list.clone();
        if let Some(path) = &self.dblist {
            wikis.extend(read_dblist(path)?);
        }
        let mut seen = std::collections::HashSet::new();
        wikis.retain(|wiki| seen.insert(wiki.clone()));
        Ok(wikis)
    }

    fn read_optional(path: Option<&Path>) -> Result<Vec<String>> {
        path.map(read_dblist).transpose().map(Option::unwrap_or_default)
    }

    pub fn private(&self) -> Result<Vec<String>> {
        Self::read_optional(self.private_dblist.as_deref())
    }

    pub fn closed(&self) -> Result<Vec<String>> {
        Self::read_optional(self.closed_dblist.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metadata: MetadataConfig,
    /// Where live media is read from. Always used read-only.
    pub source: Option<BackendConfig>,
    pub locations: BTreeMap<String, LocationConfig>,
    pub retry: RetryConfig,
    pub backup: BackupConfig,
    pub wikis: WikiConfig,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            metadata: MetadataConfig::default(),
            source: None,
            locations: BTreeMap::new(),
            retry: RetryConfig::default(),
            backup: BackupConfig::default(),
            wikis: WikiConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load and validate the configuration, reading the file at `path` (which
    /// must exist) or, without one, the default file if there is one.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => Some(path.to_path_buf()),
            None => default_path().filter(|path| path.is_file()),
        };
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = &file {
            tracing::debug!(path = %file.display(), "Reading configuration file");
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("toml") => figment.merge(Toml::file(file)),
                Some("json") => figment.merge(Json::file(file)),
                _ => figment.merge(Yaml::file(file)),
            };
        }
        Self::extract(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Malformed)?;
        config.validate()?;
        Ok(config)
    }

    /// The configured source tier.
    pub fn source(&self) -> Result<&BackendConfig> {
        self.source
            .as_ref()
            .ok_or_else(|| exn::Exn::from(ErrorKind::Invalid("no source is configured".to_string())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.locations.is_empty() {
            exn::bail!(ErrorKind::Invalid("no backup location is configured".to_string()));
        }
        if let Some(name) = self.locations.keys().find(|name| name.trim().is_empty()) {
            exn::bail!(ErrorKind::Invalid(format!("invalid location name {name:?}")));
        }
        if self.retry.max_attempts == 0 {
            exn::bail!(ErrorKind::Invalid("retry.max_attempts must be at least 1".to_string()));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            exn::bail!(ErrorKind::Invalid("retry.multiplier must be at least 1".to_string()));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            exn::bail!(ErrorKind::Invalid(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string()
            ));
        }
        let backup = &self.backup;
        if backup.batch_size == 0 || backup.concurrency == 0 || backup.per_location_concurrency == 0 {
            exn::bail!(ErrorKind::Invalid("backup sizes and concurrency must be positive".to_string()));
        }
        Ok(())
    }
}
