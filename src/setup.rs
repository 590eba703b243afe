//! Turn a validated configuration into the engine's context.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use mediabackups_config::{BackendConfig, Config};
use mediabackups_metadata::{Database, Repository};
use mediabackups_reconcile::feed::ContainerFeed;
use mediabackups_reconcile::{Context, Reconciler, RetryPolicy, Target};
use mediabackups_storage::BackendHandle;
use mediabackups_storage::backend::LocalBackend;
use std::sync::Arc;

async fn backend(name: &str, config: &BackendConfig) -> Result<BackendHandle> {
    match config {
        BackendConfig::Local { root } => {
            let backend = LocalBackend::new(name, root).or_raise(|| ErrorKind::Storage(name.to_string()))?;
            Ok(Arc::new(backend))
        },
        #[cfg(feature = "s3")]
        BackendConfig::S3 {
            bucket,
            prefix,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            let backend = mediabackups_storage::backend::S3Backend::new(
                name,
                bucket,
                prefix.clone(),
                region,
                endpoint.clone(),
                access_key_id,
                secret_access_key,
            )
            .await
            .or_raise(|| ErrorKind::Storage(name.to_string()))?;
            Ok(Arc::new(backend))
        },
        #[cfg(not(feature = "s3"))]
        BackendConfig::S3 { .. } => exn::bail!(ErrorKind::Storage(format!("{name} (built without S3 support)"))),
    }
}

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.retry.max_attempts,
        initial_backoff: config.retry.initial_backoff(),
        max_backoff: config.retry.max_backoff(),
        multiplier: config.retry.multiplier,
    }
}

pub async fn repository(config: &Config) -> Result<Repository> {
    if let Some(parent) = config.metadata.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Metadata)?;
    }
    let db = Database::connect(&config.metadata.path).await.or_raise(|| ErrorKind::Metadata)?;
    Repository::open(&db).await.or_raise(|| ErrorKind::Metadata)
}

/// Open every configured store and record the locations in the metadata
/// store, so that their ids are known.
pub async fn reconciler(config: &Config, repo: Repository) -> Result<Reconciler> {
    let source = backend("source", config.source().or_raise(|| ErrorKind::Config)?).await?;
    let mut ctx = Context::new(repo.clone(), source)
        .with_retry(retry_policy(config))
        .with_concurrency(config.backup.concurrency)
        .with_batch_size(config.backup.batch_size);
    for (name, location) in &config.locations {
        let endpoint = location.backend.endpoint();
        let recorded = repo
            .ensure_location(name, Some(&endpoint), location.writes_enabled)
            .await
            .or_raise(|| ErrorKind::Metadata)?;
        let store = backend(name, &location.backend).await?;
        ctx = ctx.with_target(Target::new(recorded, store, config.backup.per_location_concurrency));
    }
    let feed = Arc::new(ContainerFeed::new(ctx.source.clone()));
    Ok(Reconciler::new(ctx, feed))
}
