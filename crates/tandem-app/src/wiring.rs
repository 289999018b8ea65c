//! Builds stores, services and pipelines from configuration.

use std::sync::Arc;

use tracing::{info, warn};

use tandem_core::config::{resolve_path, ArtifactBackend, StoreBackend, TandemConfig};
use tandem_core::{Result, TandemError};
use tandem_pipeline::{
    AnalysisOptions, AnalysisRunner, ArtifactPublisher, ArtifactStore, DigestBuilder,
    DigestOptions, DirArtifactStore, Discovery, FetchOptions, HttpAnalysisService,
    HttpArtifactStore, HttpSummaryService, HttpTranscriptSource, Pipeline, PublishOptions,
    RetentionSweeper, RssCatalogFeed, TranscriptFetcher,
};
use tandem_storage::{DirStore, GitStore, GitStoreOptions, StateSync, SyncPolicy, VersionedStore};

/// Which providers a command needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Environment A: feed and transcript provider.
    Fetch,
    /// Environment B: analysis and summary services and artifact store.
    Process,
    /// State store only.
    Admin,
}

/// Read a secret from the environment variable named in the config.
fn secret(env_name: Option<&str>) -> Option<String> {
    let name = env_name?;
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Some(value),
        _ => None,
    }
}

pub fn build_store(config: &TandemConfig) -> Result<Arc<dyn VersionedStore>> {
    let path = resolve_path(&config.store.path);
    let store: Arc<dyn VersionedStore> = match config.store.backend {
        StoreBackend::Dir => {
            info!(path = %path.display(), "Using directory state store");
            Arc::new(DirStore::new(path))
        }
        StoreBackend::Git => {
            let token = secret(config.store.token_env.as_deref());
            if token.is_none() && config.store.token_env.is_some() {
                warn!("No store token in environment; relying on git credentials");
            }
            info!(
                path = %path.display(),
                branch = %config.store.branch,
                "Using git state store"
            );
            Arc::new(GitStore::new(GitStoreOptions {
                clone_dir: path,
                remote_url: config.store.remote_url.clone(),
                remote: config.store.remote.clone(),
                branch: config.store.branch.clone(),
                subdir: config.store.subdir.clone(),
                token,
                author_name: config.store.author_name.clone(),
                author_email: config.store.author_email.clone(),
            }))
        }
    };
    Ok(store)
}

fn build_artifact_store(config: &TandemConfig) -> Result<Arc<dyn ArtifactStore>> {
    let publish = &config.publish;
    let store: Arc<dyn ArtifactStore> = match publish.backend {
        ArtifactBackend::Dir => Arc::new(DirArtifactStore::new(resolve_path(&publish.target))),
        ArtifactBackend::Http => Arc::new(HttpArtifactStore::new(
            publish.target.clone(),
            secret(publish.token_env.as_deref()),
            publish.timeout(),
        )?),
    };
    Ok(store)
}

/// Assemble the pipeline for `role`.
pub fn build_pipeline(config: &TandemConfig, role: Role) -> Result<Pipeline> {
    let sync = StateSync::new(build_store(config)?, SyncPolicy::from(&config.sync));
    let mut pipeline = Pipeline::new(sync);

    match role {
        Role::Fetch => {
            if config.feed.enabled && !config.channels.is_empty() {
                let feed = RssCatalogFeed::new(config.channels.clone(), &config.feed)?;
                pipeline = pipeline.with_discovery(Discovery::new(Arc::new(feed)));
            } else {
                info!("No channel feeds configured; discovery disabled");
            }
            let source = HttpTranscriptSource::new(
                config.fetch.endpoint.clone(),
                config.fetch.timeout(),
            )?;
            pipeline = pipeline.with_fetcher(TranscriptFetcher::new(
                Arc::new(source),
                FetchOptions::from_config(&config.fetch, &config.retry),
            ));
        }
        Role::Process => {
            let api_key = secret(config.analysis.api_key_env.as_deref());
            let service = HttpAnalysisService::new(
                config.analysis.endpoint.clone(),
                api_key.clone(),
                config.analysis.timeout(),
            )?;
            let artifacts = build_artifact_store(config)?;
            pipeline = pipeline
                .with_runner(AnalysisRunner::new(
                    Arc::new(service),
                    AnalysisOptions::from_config(&config.analysis, &config.retry),
                ))
                .with_publisher(ArtifactPublisher::new(
                    artifacts.clone(),
                    PublishOptions::from_config(&config.publish, &config.retry),
                ))
                .with_sweeper(RetentionSweeper::new(config.sweep.sweep_abandoned));
            if config.digest.enabled {
                let summaries = HttpSummaryService::new(
                    config.digest.endpoint.clone(),
                    api_key,
                    config.digest.timeout(),
                )?;
                pipeline = pipeline.with_digest(DigestBuilder::new(
                    Arc::new(summaries),
                    artifacts,
                    DigestOptions::from_config(&config.digest, &config.analysis)?,
                ));
            } else {
                info!("Digest disabled");
            }
        }
        Role::Admin => {}
    }
    Ok(pipeline)
}

/// Refuse a discovery-only run when discovery cannot be wired.
pub fn require_feed(config: &TandemConfig) -> Result<()> {
    if !config.feed.enabled {
        return Err(TandemError::Config("feed.enabled is false".to_string()));
    }
    if config.channels.is_empty() {
        return Err(TandemError::Config(
            "no [[channels]] configured for discovery".to_string(),
        ));
    }
    Ok(())
}

/// Refuse a digest-only run when digests are switched off.
pub fn require_digest(config: &TandemConfig) -> Result<()> {
    if config.digest.enabled {
        Ok(())
    } else {
        Err(TandemError::Config("digest.enabled is false".to_string()))
    }
}
