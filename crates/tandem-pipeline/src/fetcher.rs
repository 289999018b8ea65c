//! Transcript fetching stage (environment A).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use tandem_catalog::{CatalogStore, Cas, Mutation, MutationKind, Seen, StatusPredicate};
use tandem_core::config::{FetchConfig, RetryConfig};
use tandem_core::types::{TranscriptBlob, TranscriptStatus, VideoRecord};
use tandem_core::{Result, TandemError};

use crate::report::StageReport;
use crate::services::{TranscriptError, TranscriptSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl FetchOptions {
    pub fn from_config(fetch: &FetchConfig, retry: &RetryConfig) -> Self {
        Self {
            concurrency: fetch.concurrency.max(1),
            timeout: fetch.timeout(),
            max_attempts: retry.fetch_attempts.max(1),
        }
    }
}

pub struct TranscriptFetcher {
    source: Arc<dyn TranscriptSource>,
    options: FetchOptions,
}

enum Fetched {
    Text(String),
    Failed(String),
    Blocked(String),
}

impl TranscriptFetcher {
    pub fn new(source: Arc<dyn TranscriptSource>, options: FetchOptions) -> Self {
        Self { source, options }
    }

    /// Records that still need a transcript and have budget left.
    pub fn candidates(&self, catalog: &CatalogStore) -> Vec<VideoRecord> {
        let filter = StatusPredicate::any()
            .transcript(TranscriptStatus::Missing)
            .transcript(TranscriptStatus::FetchFailed)
            .abandoned(false)
            .swept(false);
        catalog
            .list(&filter)
            .into_iter()
            .filter(|r| r.fetch_attempts < self.options.max_attempts)
            .collect()
    }

    /// Fetch every candidate once.
    ///
    /// Returns `EnvironmentBlocked` as soon as the provider refuses this
    /// environment; the caller must then discard the catalog uncommitted.
    pub async fn run(&self, catalog: &mut CatalogStore) -> Result<StageReport> {
        let mut report = StageReport::new("fetch");
        let candidates = self.candidates(catalog);
        report.considered = candidates.len();
        if candidates.is_empty() {
            debug!("No transcripts to fetch");
            return Ok(report);
        }
        info!(count = candidates.len(), "Fetching transcripts");

        let source = &self.source;
        let timeout = self.options.timeout;
        let mut outcomes = stream::iter(candidates)
            .map(|record| async move {
                let outcome = match tokio::time::timeout(timeout, source.fetch(&record)).await {
                    Ok(Ok(text)) if text.trim().is_empty() => {
                        Fetched::Failed("provider returned an empty transcript".to_string())
                    }
                    Ok(Ok(text)) => Fetched::Text(text),
                    Ok(Err(TranscriptError::EnvironmentBlocked(reason))) => {
                        Fetched::Blocked(reason)
                    }
                    Ok(Err(e)) => Fetched::Failed(e.to_string()),
                    Err(_) => Fetched::Failed(format!("timed out after {:?}", timeout)),
                };
                (record, outcome)
            })
            .buffer_unordered(self.options.concurrency);

        while let Some((record, outcome)) = outcomes.next().await {
            let seen = Seen::of(&record);
            let now = Utc::now();
            match outcome {
                Fetched::Blocked(reason) => {
                    warn!(video_id = %record.id, %reason, "Transcript provider blocked this environment");
                    return Err(TandemError::EnvironmentBlocked {
                        video_id: record.id.to_string(),
                        reason,
                    });
                }
                Fetched::Text(text) => {
                    let bytes = text.len();
                    let cas = catalog.record(Mutation::new(
                        record.id.clone(),
                        now,
                        MutationKind::TranscriptFetched {
                            seen,
                            transcript: TranscriptBlob::new(text, now),
                        },
                    ))?;
                    match cas {
                        Cas::Applied => {
                            debug!(video_id = %record.id, bytes, "Transcript fetched");
                            report.succeeded += 1;
                        }
                        Cas::Conflict { .. } => report.conflicts += 1,
                    }
                }
                Fetched::Failed(error) => {
                    let abandon = record.fetch_attempts + 1 >= self.options.max_attempts;
                    warn!(
                        video_id = %record.id,
                        attempt = record.fetch_attempts + 1,
                        abandon,
                        "Transcript fetch failed: {}",
                        error
                    );
                    let cas = catalog.record(Mutation::new(
                        record.id.clone(),
                        now,
                        MutationKind::TranscriptFailed {
                            seen,
                            error,
                            abandon,
                        },
                    ))?;
                    if cas.is_applied() {
                        report.failed += 1;
                        if abandon {
                            report.abandoned += 1;
                        }
                    } else {
                        report.conflicts += 1;
                    }
                }
            }
        }

        info!("{}", report);
        Ok(report)
    }
}
