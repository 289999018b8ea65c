//! Analysis stage (environment B).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use tandem_catalog::{CatalogStore, Cas, Mutation, MutationKind, Seen, StatusPredicate};
use tandem_core::config::{AnalysisConfig, RetryConfig};
use tandem_core::types::{AnalysisResult, AnalysisStatus, TranscriptStatus, VideoRecord};
use tandem_core::Result;

use crate::report::StageReport;
use crate::services::{AnalysisOutput, AnalysisRequest, AnalysisService, ServiceError};

const TRUNCATION_MARKER: &str = "... [truncated]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisOptions {
    pub concurrency: usize,
    pub timeout: Duration,
    pub max_attempts: u32,
    /// Transcripts longer than this many characters are cut before analysis.
    pub max_transcript_chars: usize,
    pub model: Option<String>,
}

impl AnalysisOptions {
    pub fn from_config(analysis: &AnalysisConfig, retry: &RetryConfig) -> Self {
        Self {
            concurrency: analysis.concurrency.max(1),
            timeout: analysis.timeout(),
            max_attempts: retry.analysis_attempts.max(1),
            max_transcript_chars: analysis.max_transcript_chars,
            model: analysis.model.clone(),
        }
    }
}

pub struct AnalysisRunner {
    service: Arc<dyn AnalysisService>,
    options: AnalysisOptions,
}

impl AnalysisRunner {
    pub fn new(service: Arc<dyn AnalysisService>, options: AnalysisOptions) -> Self {
        Self { service, options }
    }

    /// Fetched records awaiting (another) analysis attempt.
    pub fn candidates(&self, catalog: &CatalogStore) -> Vec<VideoRecord> {
        let filter = StatusPredicate::any()
            .transcript(TranscriptStatus::Fetched)
            .analysis(AnalysisStatus::Pending)
            .analysis(AnalysisStatus::AnalysisFailed)
            .abandoned(false)
            .swept(false);
        catalog
            .list(&filter)
            .into_iter()
            .filter(|r| r.analysis_attempts < self.options.max_attempts)
            .filter(|r| catalog.transcript(&r.id).is_some())
            .collect()
    }

    fn request(&self, catalog: &CatalogStore, record: &VideoRecord) -> Option<AnalysisRequest> {
        let blob = catalog.transcript(&record.id)?;
        let (transcript, truncated) =
            truncate_chars(&blob.text, self.options.max_transcript_chars);
        Some(AnalysisRequest {
            video_id: record.id.clone(),
            title: record.source.title.clone(),
            channel_name: record.source.channel_name.clone(),
            transcript,
            truncated,
            model: self.options.model.clone(),
        })
    }

    pub async fn run(&self, catalog: &mut CatalogStore) -> Result<StageReport> {
        let mut report = StageReport::new("analyze");
        let view: &CatalogStore = catalog;
        let jobs: Vec<(VideoRecord, AnalysisRequest)> = self
            .candidates(view)
            .into_iter()
            .filter_map(|record| {
                let request = self.request(view, &record)?;
                Some((record, request))
            })
            .collect();
        report.considered = jobs.len();
        if jobs.is_empty() {
            debug!("Nothing to analyze");
            return Ok(report);
        }
        info!(count = jobs.len(), "Analyzing transcripts");

        let service = &self.service;
        let timeout = self.options.timeout;
        let mut outcomes = stream::iter(jobs)
            .map(|(record, request)| async move {
                if request.truncated {
                    debug!(video_id = %record.id, "Transcript truncated for analysis");
                }
                let outcome: std::result::Result<AnalysisOutput, ServiceError> =
                    match tokio::time::timeout(timeout, service.analyze(&request)).await {
                        Ok(result) => result,
                        Err(_) => Err(ServiceError::Timeout(timeout)),
                    };
                (record, outcome)
            })
            .buffer_unordered(self.options.concurrency);

        while let Some((record, outcome)) = outcomes.next().await {
            let seen = Seen::<AnalysisStatus>::of(&record);
            let now = Utc::now();
            let kind = match outcome {
                Ok(output) => MutationKind::Analyzed {
                    seen,
                    result: AnalysisResult::new(
                        record.id.clone(),
                        output.payload,
                        output.model.or_else(|| self.options.model.clone()),
                        now,
                    ),
                    raw: Some(output.raw),
                },
                Err(e) => {
                    let abandon = record.analysis_attempts + 1 >= self.options.max_attempts;
                    warn!(
                        video_id = %record.id,
                        attempt = record.analysis_attempts + 1,
                        abandon,
                        "Analysis failed: {}",
                        e
                    );
                    MutationKind::AnalysisFailed {
                        seen,
                        error: e.to_string(),
                        abandon,
                    }
                }
            };
            let failed = matches!(kind, MutationKind::AnalysisFailed { .. });
            let abandon = matches!(kind, MutationKind::AnalysisFailed { abandon: true, .. });

            match catalog.record(Mutation::new(record.id.clone(), now, kind))? {
                Cas::Applied if failed => {
                    report.failed += 1;
                    if abandon {
                        report.abandoned += 1;
                    }
                }
                Cas::Applied => {
                    debug!(video_id = %record.id, "Analysis recorded");
                    report.succeeded += 1;
                }
                Cas::Conflict { .. } => report.conflicts += 1,
            }
        }

        info!("{}", report);
        Ok(report)
    }
}

/// Cut `text` to at most `max` characters, on a character boundary.
fn truncate_chars(text: &str, max: usize) -> (String, bool) {
    match text.char_indices().nth(max) {
        Some((cut, _)) if max > 0 => (format!("{}{}", &text[..cut], TRUNCATION_MARKER), true),
        _ => (text.to_string(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAnalysisService;
    use tandem_catalog::PipelineSnapshot;
    use tandem_core::types::{SourceMeta, TranscriptBlob, VideoId};

    fn vid(raw: &str) -> VideoId {
        VideoId::parse(raw).unwrap()
    }

    fn fetched_catalog(ids: &[&str]) -> CatalogStore {
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        for id in ids {
            catalog
                .upsert(
                    vid(id),
                    SourceMeta {
                        channel_id: "c".to_string(),
                        channel_name: "C".to_string(),
                        title: format!("Video {}", id),
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
                        transcript: TranscriptBlob::new(format!("words of {}", id), Utc::now()),
                    },
                ))
                .unwrap();
        }
        catalog
    }

    fn options() -> AnalysisOptions {
        AnalysisOptions {
            concurrency: 2,
            timeout: Duration::from_secs(5),
            max_attempts: 2,
            max_transcript_chars: 1_000,
            model: Some("default-model".to_string()),
        }
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), ("short".to_string(), false));
        let (cut, truncated) = truncate_chars("héllo wörld", 5);
        assert!(truncated);
        assert_eq!(cut, "héllo... [truncated]");
        assert_eq!(truncate_chars("exact", 5), ("exact".to_string(), false));
    }

    #[tokio::test]
    async fn test_analyzes_fetched_records() {
        let service = Arc::new(MockAnalysisService::new());
        let runner = AnalysisRunner::new(service.clone(), options());
        let mut catalog = fetched_catalog(&["a", "b"]);

        let report = runner.run(&mut catalog).await.unwrap();
        assert_eq!(report.succeeded, 2);
        let record = catalog.get(&vid("a")).unwrap();
        assert_eq!(record.analysis_status, AnalysisStatus::Analyzed);
        let result = catalog.latest_result(&vid("a")).unwrap();
        assert_eq!(result.model.as_deref(), Some("default-model"));
        assert_eq!(result.payload["video_id"], "a");
        assert!(catalog.snapshot().scratch.contains_key(&vid("a")));

        let requests = service.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.transcript.starts_with("words of")));
    }

    #[tokio::test]
    async fn test_skips_records_without_transcript() {
        let service = Arc::new(MockAnalysisService::new());
        let runner = AnalysisRunner::new(service.clone(), options());
        let mut catalog = fetched_catalog(&["a"]);
        catalog
            .upsert(
                vid("missing"),
                SourceMeta {
                    channel_id: "c".to_string(),
                    channel_name: "C".to_string(),
                    title: "Missing".to_string(),
                    published_at: None,
                    url: None,
                },
                Utc::now(),
            )
            .unwrap();

        let report = runner.run(&mut catalog).await.unwrap();
        assert_eq!(report.considered, 1);
        assert_eq!(
            catalog.get(&vid("missing")).unwrap().analysis_status,
            AnalysisStatus::Pending
        );
        assert!(catalog.latest_result(&vid("missing")).is_none());
    }

    #[tokio::test]
    async fn test_failures_retry_then_abandon() {
        let service = Arc::new(MockAnalysisService::new().failing("a"));
        let runner = AnalysisRunner::new(service, options());
        let mut catalog = fetched_catalog(&["a"]);

        let first = runner.run(&mut catalog).await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.abandoned, 0);
        assert_eq!(
            catalog.get(&vid("a")).unwrap().analysis_status,
            AnalysisStatus::AnalysisFailed
        );

        let second = runner.run(&mut catalog).await.unwrap();
        assert_eq!(second.abandoned, 1);
        assert!(catalog.get(&vid("a")).unwrap().is_abandoned());
        assert!(runner.candidates(&catalog).is_empty());
    }

    #[tokio::test]
    async fn test_long_transcripts_are_truncated() {
        let service = Arc::new(MockAnalysisService::new());
        let mut opts = options();
        opts.max_transcript_chars = 4;
        let runner = AnalysisRunner::new(service.clone(), opts);
        let mut catalog = fetched_catalog(&["a"]);

        runner.run(&mut catalog).await.unwrap();
        let requests = service.requests();
        assert!(requests[0].truncated);
        assert_eq!(requests[0].transcript, "word... [truncated]");
    }
}
