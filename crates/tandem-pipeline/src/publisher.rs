//! Artifact publishing stage (environment B).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use tandem_catalog::{CatalogStore, Cas, Mutation, MutationKind, Seen, StatusPredicate};
use tandem_core::config::{PublishConfig, RetryConfig};
use tandem_core::types::{AnalysisStatus, PublishStatus, VideoRecord};
use tandem_core::Result;

use crate::report::StageReport;
use crate::services::{put_json, Artifact, ArtifactStore, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_attempts: u32,
}

impl PublishOptions {
    pub fn from_config(publish: &PublishConfig, retry: &RetryConfig) -> Self {
        Self {
            concurrency: publish.concurrency.max(1),
            timeout: publish.timeout(),
            max_attempts: retry.publish_attempts.max(1),
        }
    }
}

pub struct ArtifactPublisher {
    store: Arc<dyn ArtifactStore>,
    options: PublishOptions,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn ArtifactStore>, options: PublishOptions) -> Self {
        Self { store, options }
    }

    pub fn candidates(&self, catalog: &CatalogStore) -> Vec<VideoRecord> {
        let filter = StatusPredicate::any()
            .analysis(AnalysisStatus::Analyzed)
            .publish(PublishStatus::Unpublished)
            .abandoned(false)
            .swept(false);
        catalog
            .list(&filter)
            .into_iter()
            .filter(|r| r.publish_attempts < self.options.max_attempts)
            .filter(|r| catalog.latest_result(&r.id).is_some())
            .collect()
    }

    /// Upload the latest result of every analyzed, unpublished video.
    ///
    /// Artifacts are keyed by result id. An upload whose catalog update is
    /// later dropped stays an unreferenced object and never replaces the
    /// artifact a committed record points at.
    pub async fn run(&self, catalog: &mut CatalogStore) -> Result<StageReport> {
        let mut report = StageReport::new("publish");
        let jobs: Vec<(VideoRecord, Artifact)> = self
            .candidates(catalog)
            .into_iter()
            .filter_map(|record| {
                let artifact = Artifact::build(&record, catalog.latest_result(&record.id)?);
                Some((record, artifact))
            })
            .collect();
        report.considered = jobs.len();
        if jobs.is_empty() {
            debug!("Nothing to publish");
            return Ok(report);
        }
        info!(count = jobs.len(), "Publishing artifacts");

        let store = self.store.as_ref();
        let timeout = self.options.timeout;
        let mut outcomes = stream::iter(jobs)
            .map(|(record, artifact)| async move {
                let key = artifact.key();
                let upload = put_json(store, &key, &artifact);
                let outcome = match tokio::time::timeout(timeout, upload).await {
                    Ok(result) => result,
                    Err(_) => Err(ServiceError::Timeout(timeout)),
                };
                (record, artifact, outcome)
            })
            .buffer_unordered(self.options.concurrency);

        while let Some((record, artifact, outcome)) = outcomes.next().await {
            let seen = Seen::<PublishStatus>::of(&record);
            let now = Utc::now();
            match outcome {
                Ok(location) => {
                    let cas = catalog.record(Mutation::new(
                        record.id.clone(),
                        now,
                        MutationKind::Published {
                            seen,
                            result_id: artifact.result.id,
                            location: location.clone(),
                        },
                    ))?;
                    match cas {
                        Cas::Applied => {
                            debug!(video_id = %record.id, %location, "Artifact published");
                            report.succeeded += 1;
                        }
                        Cas::Conflict { .. } => report.conflicts += 1,
                    }
                }
                Err(e) => {
                    let abandon = record.publish_attempts + 1 >= self.options.max_attempts;
                    warn!(
                        video_id = %record.id,
                        attempt = record.publish_attempts + 1,
                        abandon,
                        "Publish failed: {}",
                        e
                    );
                    let cas = catalog.record(Mutation::new(
                        record.id.clone(),
                        now,
                        MutationKind::PublishFailed {
                            seen,
                            error: e.to_string(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockArtifactStore;
    use tandem_catalog::PipelineSnapshot;
    use tandem_core::types::{AnalysisResult, SourceMeta, TranscriptBlob, VideoId};

    fn vid(raw: &str) -> VideoId {
        VideoId::parse(raw).unwrap()
    }

    fn analyzed_catalog(ids: &[&str]) -> CatalogStore {
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        for id in ids {
            catalog
                .upsert(
                    vid(id),
                    SourceMeta {
                        channel_id: "c".to_string(),
                        channel_name: "C".to_string(),
                        title: id.to_string(),
                        published_at: None,
                        url: None,
                    },
                    Utc::now(),
                )
                .unwrap();
            let record = catalog.get(&vid(id)).unwrap().clone();
            catalog
                .record(Mutation::new(
                    vid(id),
                    Utc::now(),
                    MutationKind::TranscriptFetched {
                        seen: Seen::of(&record),
                        transcript: TranscriptBlob::new("text", Utc::now()),
                    },
                ))
                .unwrap();
            let record = catalog.get(&vid(id)).unwrap().clone();
            catalog
                .record(Mutation::new(
                    vid(id),
                    Utc::now(),
                    MutationKind::Analyzed {
                        seen: Seen::of(&record),
                        result: AnalysisResult::new(
                            vid(id),
                            serde_json::json!({"summary": id}),
                            None,
                            Utc::now(),
                        ),
                        raw: None,
                    },
                ))
                .unwrap();
        }
        catalog
    }

    fn options() -> PublishOptions {
        PublishOptions {
            concurrency: 2,
            timeout: Duration::from_secs(5),
            max_attempts: 2,
        }
    }

    #[tokio::test]
    async fn test_publishes_latest_result() {
        let store = Arc::new(MockArtifactStore::new());
        let publisher = ArtifactPublisher::new(store.clone(), options());
        let mut catalog = analyzed_catalog(&["a"]);

        let report = publisher.run(&mut catalog).await.unwrap();
        assert_eq!(report.succeeded, 1);
        let latest = catalog.latest_result(&vid("a")).unwrap().id;
        let record = catalog.get(&vid("a")).unwrap();
        assert_eq!(record.publish_status, PublishStatus::Published);
        assert_eq!(
            record.artifact_location,
            Some(format!("mock://videos/a/{}.json", latest))
        );

        let artifacts = store.artifacts();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].result.id, latest);
        assert!(publisher.candidates(&catalog).is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_runs_upload_distinct_objects() {
        // Two runs start from the same base; each analyzes the video anew.
        let base = analyzed_catalog(&["a"]).into_parts().0;
        let store = Arc::new(MockArtifactStore::new());
        let publisher = ArtifactPublisher::new(store.clone(), options());

        let mut locations = Vec::new();
        for _ in 0..2 {
            let mut catalog = CatalogStore::new(base.clone());
            catalog.reanalyze(&vid("a"), Utc::now()).unwrap();
            let record = catalog.get(&vid("a")).unwrap().clone();
            catalog
                .record(Mutation::new(
                    vid("a"),
                    Utc::now(),
                    MutationKind::Analyzed {
                        seen: Seen::of(&record),
                        result: AnalysisResult::new(
                            vid("a"),
                            serde_json::json!({"summary": "again"}),
                            None,
                            Utc::now(),
                        ),
                        raw: None,
                    },
                ))
                .unwrap();
            publisher.run(&mut catalog).await.unwrap();
            let published = catalog.get(&vid("a")).unwrap();
            locations.push(published.artifact_location.clone().unwrap());
        }

        assert_ne!(locations[0], locations[1]);
        let keys = store.keys("videos/a/");
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_unpublished() {
        let store = Arc::new(MockArtifactStore::new().failing("a"));
        let publisher = ArtifactPublisher::new(store, options());
        let mut catalog = analyzed_catalog(&["a", "b"]);

        let report = publisher.run(&mut catalog).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let record = catalog.get(&vid("a")).unwrap();
        assert_eq!(record.publish_status, PublishStatus::Unpublished);
        assert_eq!(record.publish_attempts, 1);
        assert!(record.artifact_location.is_none());

        let report = publisher.run(&mut catalog).await.unwrap();
        assert_eq!(report.abandoned, 1);
        assert!(catalog.get(&vid("a")).unwrap().is_abandoned());
    }
}
