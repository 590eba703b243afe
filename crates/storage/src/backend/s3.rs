//! S3-compatible storage backend.
//!
//! Backup locations are S3-compatible object stores (MinIO clusters in each
//! datacenter, or any other S3 endpoint). Credentials are provided
//! explicitly per location through the configuration file.

use crate::{
    FileInfo, StorageBackend,
    backend::{Deletion, FileInfoStream},
    error::{ErrorKind, Result},
    validate_path,
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::UtcDateTime;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests per location.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// S3-compatible storage backend.
///
/// # Examples
///
/// ```no_run
/// use mediabackups_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "eqiad",
///     "mediabackups",
///     None,
///     "us-east-1",
///     Some("https://backup1001.eqiad.wmnet:9000".to_string()),
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - Location name (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix (acts as virtual directory)
    /// * `region` - Region, provider-specific for non-AWS services
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` / `key_secret` - Access credentials
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let prefix = prefix
            .map(validate_path)
            .transpose()?
            .map(|p| p.to_str().map(|s| s.to_string()).ok_or_raise(|| ErrorKind::InvalidPath(p)))
            .transpose()?;
        let credentials = Credentials::new(key_id, key_secret, None, None, "mediabackups-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // 1 initial attempt + 3 retries, with the SDK's exponential backoff.
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for MinIO and other S3-compatible services.
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Ok(Self {
            name: name.into(),
            client: Client::from_conf(config_builder.build()),
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    fn full_key(&self, path: &Path) -> Result<String> {
        Ok(join_key(self.prefix.as_deref(), &validate_path(path)?))
    }

    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        validate_path(strip_key(self.prefix.as_deref(), key))
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }

    fn parse_datetime(dt: Option<&DateTime>) -> Result<UtcDateTime> {
        match dt {
            Some(dt) => UtcDateTime::from_unix_timestamp_nanos(dt.as_nanos())
                .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string())),
            None => Ok(UtcDateTime::UNIX_EPOCH),
        }
    }

    fn map_sdk_error<E, R>(err: SdkError<E, R>) -> ErrorKind
    where
        E: std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        ErrorKind::Network(DisplayErrorContext(&err).to_string())
    }

    fn file_info(path: PathBuf, size: Option<i64>, modified: Option<&DateTime>, etag: Option<&str>) -> Result<FileInfo> {
        let size = u64::try_from(size.unwrap_or_default())
            .or_raise(|| ErrorKind::BackendError(format!("negative object size for {}", path.display())))?;
        let info = FileInfo::new(path, size, Self::parse_datetime(modified)?);
        Ok(match etag.and_then(md5_from_etag) {
            Some(md5) => info.with_md5(md5),
            None => info,
        })
    }
}

/// Join an optional key prefix and a validated relative path.
fn join_key(prefix: Option<&str>, path: &Path) -> String {
    let path_str = path.to_string_lossy();
    match prefix {
        Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), path_str),
        None => path_str.into_owned(),
    }
}

fn strip_key<'a>(prefix: Option<&str>, key: &'a str) -> &'a str {
    match prefix {
        Some(prefix) => key.strip_prefix(prefix.trim_end_matches('/')).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
        None => key,
    }
}

/// Single-part uploads use the hex md5 of the content as ETag; multipart
/// ETags (`{md5}-{parts}`) are not content digests.
fn md5_from_etag(etag: &str) -> Option<String> {
    let etag = etag.trim_matches('"');
    (etag.len() == 32 && etag.bytes().all(|b| b.is_ascii_hexdigit())).then(|| etag.to_ascii_lowercase())
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> FileInfoStream<'a> {
        let key_prefix = match prefix.map(validate_path).transpose() {
            Ok(Some(pfx)) => Some(join_key(self.prefix.as_deref(), &pfx)),
            Ok(None) => self.prefix.as_ref().map(|p| format!("{}/", p.trim_end_matches('/'))),
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };

        Box::pin(stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(key_prefix)
                .into_paginator()
                .send();
            while let Some(page) = pages.next().await {
                let page = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_sdk_error(err)));
                        break;
                    }
                };
                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    let info = self
                        .relative_path(key)
                        .and_then(|path| Self::file_info(path, object.size(), object.last_modified(), object.e_tag()));
                    yield info;
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(err) if matches!(&*err, ErrorKind::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(&key).send().await {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(err) => return Err(Self::map_sdk_error(err).into()),
        };
        let body = output.body.collect().await.or_raise(|| ErrorKind::Network(format!("reading body of {key}")))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(Self::map_sdk_error)?;
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<Deletion> {
        // S3 deletes are idempotent and do not say whether anything was
        // removed, so probe first.
        if !self.exists(path).await? {
            return Ok(Deletion::AlreadyAbsent);
        }
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client.delete_object().bucket(&self.bucket).key(&key).send().await.map_err(Self::map_sdk_error)?;
        Ok(Deletion::Confirmed)
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(head) => Self::file_info(validate_path(path)?, head.content_length(), head.last_modified(), head.e_tag()),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                exn::bail!(ErrorKind::NotFound(path.to_path_buf()))
            },
            Err(err) => Err(Self::map_sdk_error(err).into()),
        }
    }
}
