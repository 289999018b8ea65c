//! Digest stage (environment B).
//!
//! Summarizes every analysis that falls in the current schedule window into
//! one Markdown digest. Digests are appended to the period's history in the
//! snapshot and uploaded next to the video artifacts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_catalog::{CatalogStore, Cas, StatusPredicate};
use tandem_core::config::{AnalysisConfig, DigestConfig, ScheduleKind};
use tandem_core::types::{AnalysisStatus, Digest, DigestSource};
use tandem_core::Result;

use crate::report::StageReport;
use crate::services::{
    put_json, ArtifactStore, DigestEntry, DigestRequest, ServiceError, SummaryService,
    MARKDOWN_CONTENT_TYPE,
};

/// Weekly windows opened before this hour on their start day still belong
/// to the previous week.
const WEEK_ROLLOVER_HOUR: u32 = 6;

/// Which analyses a digest covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestSchedule {
    RollingDays(u32),
    Weekly(Weekday),
    Daily,
}

/// Start of a digest window and the names it is filed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestWindow {
    pub since: DateTime<Utc>,
    /// File-safe period name, e.g. `2025-w10`.
    pub period: String,
    pub label: String,
}

impl DigestSchedule {
    pub fn from_config(digest: &DigestConfig) -> Result<Self> {
        Ok(match digest.schedule {
            ScheduleKind::RollingDays => DigestSchedule::RollingDays(digest.days.max(1)),
            ScheduleKind::Weekly => DigestSchedule::Weekly(digest.start_weekday()?),
            ScheduleKind::Daily => DigestSchedule::Daily,
        })
    }

    pub fn window(&self, now: DateTime<Utc>) -> DigestWindow {
        match *self {
            DigestSchedule::RollingDays(days) => DigestWindow {
                since: now - chrono::Duration::days(i64::from(days)),
                period: now.format("%Y-%m-%d").to_string(),
                label: format!("last {} days", days),
            },
            DigestSchedule::Weekly(start) => {
                let mut back = (now.weekday().num_days_from_monday() + 7
                    - start.num_days_from_monday())
                    % 7;
                if back == 0 && now.hour() < WEEK_ROLLOVER_HOUR {
                    back = 7;
                }
                let since = midnight(now - chrono::Duration::days(i64::from(back)));
                DigestWindow {
                    since,
                    period: since.format("%Y-w%W").to_string(),
                    label: since.format("week %W").to_string(),
                }
            }
            DigestSchedule::Daily => {
                let day = now.format("%Y-%m-%d").to_string();
                DigestWindow {
                    since: midnight(now),
                    period: day.clone(),
                    label: day,
                }
            }
        }
    }
}

fn midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&at.date_naive().and_time(NaiveTime::MIN))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestOptions {
    pub schedule: DigestSchedule,
    pub timeout: Duration,
    pub model: Option<String>,
}

impl DigestOptions {
    pub fn from_config(digest: &DigestConfig, analysis: &AnalysisConfig) -> Result<Self> {
        Ok(Self {
            schedule: DigestSchedule::from_config(digest)?,
            timeout: digest.timeout(),
            model: analysis.model.clone(),
        })
    }
}

pub struct DigestBuilder {
    service: Arc<dyn SummaryService>,
    store: Arc<dyn ArtifactStore>,
    options: DigestOptions,
}

impl DigestBuilder {
    pub fn new(
        service: Arc<dyn SummaryService>,
        store: Arc<dyn ArtifactStore>,
        options: DigestOptions,
    ) -> Self {
        Self {
            service,
            store,
            options,
        }
    }

    /// Latest result of every analyzed video published since `since`.
    ///
    /// Videos without a feed timestamp count as published when discovered.
    pub fn entries(&self, catalog: &CatalogStore, since: DateTime<Utc>) -> Vec<DigestEntry> {
        let filter = StatusPredicate::any().analysis(AnalysisStatus::Analyzed);
        catalog
            .list(&filter)
            .into_iter()
            .filter(|r| r.source.published_at.unwrap_or(r.discovered_at) >= since)
            .filter_map(|record| {
                let result = catalog.latest_result(&record.id)?;
                Some(DigestEntry {
                    video_id: record.id.clone(),
                    result_id: result.id,
                    title: record.source.title.clone(),
                    channel_name: record.source.channel_name.clone(),
                    published_at: record.source.published_at,
                    payload: result.payload.clone(),
                })
            })
            .collect()
    }

    pub async fn run(&self, catalog: &mut CatalogStore) -> Result<StageReport> {
        self.run_at(catalog, Utc::now()).await
    }

    /// Build the digest of the window containing `now`.
    ///
    /// Nothing is recorded when the window is empty or when the latest
    /// digest of the period already covers the same results. Service and
    /// upload failures are counted, not raised; the next run tries again.
    pub async fn run_at(
        &self,
        catalog: &mut CatalogStore,
        now: DateTime<Utc>,
    ) -> Result<StageReport> {
        let mut report = StageReport::new("digest");
        let window = self.options.schedule.window(now);
        let entries = self.entries(catalog, window.since);
        report.considered = entries.len();
        if entries.is_empty() {
            debug!(period = %window.period, "No analyses in digest window");
            return Ok(report);
        }

        let sources: Vec<DigestSource> = entries
            .iter()
            .map(|e| DigestSource {
                video_id: e.video_id.clone(),
                result_id: e.result_id,
            })
            .collect();
        if let Some(latest) = catalog.digests(&window.period).last() {
            if latest.covers(&sources) {
                debug!(period = %window.period, digest = %latest.id, "Digest is current");
                report.skipped = 1;
                return Ok(report);
            }
        }

        let request = DigestRequest {
            period: window.period.clone(),
            label: window.label.clone(),
            since: window.since,
            model: self.options.model.clone(),
            entries,
        };
        info!(
            period = %request.period,
            videos = request.entries.len(),
            "Building digest"
        );

        let timeout = self.options.timeout;
        let summary = match tokio::time::timeout(timeout, self.service.summarize(&request)).await
        {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(timeout)),
        };
        let summary = match summary {
            Ok(summary) => summary,
            Err(e) => {
                warn!(period = %request.period, "Summary failed: {}", e);
                report.failed = 1;
                return Ok(report);
            }
        };

        let mut digest = Digest {
            id: Uuid::new_v4(),
            period: request.period.clone(),
            label: request.label.clone(),
            since: request.since,
            created_at: now,
            model: summary.model.or_else(|| request.model.clone()),
            summary: summary.text,
            sources,
            channels: request.channels(),
            location: None,
        };

        match tokio::time::timeout(timeout, self.upload(&digest)).await {
            Ok(Ok(location)) => digest.location = Some(location),
            Ok(Err(e)) => {
                warn!(period = %digest.period, "Digest upload failed: {}", e);
                report.failed = 1;
                return Ok(report);
            }
            Err(_) => {
                warn!(period = %digest.period, "Digest upload timed out after {:?}", timeout);
                report.failed = 1;
                return Ok(report);
            }
        }

        let id = digest.id;
        let period = digest.period.clone();
        match catalog.record_digest(digest)? {
            Cas::Applied => {
                info!(%period, digest = %id, "Digest recorded");
                report.succeeded = 1;
            }
            Cas::Conflict { .. } => report.conflicts = 1,
        }
        Ok(report)
    }

    /// Upload the JSON document and its Markdown rendering. Returns the
    /// location of the JSON document.
    async fn upload(&self, digest: &Digest) -> std::result::Result<String, ServiceError> {
        let base = format!("digests/{}/{}", digest.period, digest.id);
        let location = put_json(self.store.as_ref(), &format!("{}.json", base), digest).await?;
        self.store
            .put(
                &format!("{}.md", base),
                MARKDOWN_CONTENT_TYPE,
                render_markdown(digest).into_bytes(),
            )
            .await?;
        Ok(location)
    }
}

/// Markdown document uploaded next to the JSON digest.
pub fn render_markdown(digest: &Digest) -> String {
    format!(
        "# Digest {} ({})\n\n_{} videos from {} channels since {}_\n\n{}\n",
        digest.period,
        digest.label,
        digest.sources.len(),
        digest.channels.len(),
        digest.since.format("%Y-%m-%d %H:%M UTC"),
        digest.summary.trim_end()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockArtifactStore, MockSummaryService};
    use tandem_catalog::{Mutation, MutationKind, PipelineSnapshot, Seen};
    use tandem_core::types::{AnalysisResult, SourceMeta, TranscriptBlob, VideoId};

    fn vid(raw: &str) -> VideoId {
        VideoId::parse(raw).unwrap()
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).unwrap()
    }

    /// Add a video published on March `day` and carry it through analysis.
    fn add_analyzed(catalog: &mut CatalogStore, id: &str, channel: &str, day: u32) {
        catalog
            .upsert(
                vid(id),
                SourceMeta {
                    channel_id: channel.to_lowercase(),
                    channel_name: channel.to_string(),
                    title: format!("Video {}", id),
                    published_at: Some(at(day, 12)),
                    url: None,
                },
                at(day, 13),
            )
            .unwrap();
        let record = catalog.get(&vid(id)).unwrap().clone();
        catalog
            .record(Mutation::new(
                vid(id),
                at(day, 14),
                MutationKind::TranscriptFetched {
                    seen: Seen::of(&record),
                    transcript: TranscriptBlob::new("words", at(day, 14)),
                },
            ))
            .unwrap();
        let record = catalog.get(&vid(id)).unwrap().clone();
        catalog
            .record(Mutation::new(
                vid(id),
                at(day, 15),
                MutationKind::Analyzed {
                    seen: Seen::of(&record),
                    result: AnalysisResult::new(
                        vid(id),
                        serde_json::json!({"players": [id]}),
                        None,
                        at(day, 15),
                    ),
                    raw: None,
                },
            ))
            .unwrap();
    }

    fn builder(
        service: Arc<MockSummaryService>,
        store: Arc<MockArtifactStore>,
    ) -> DigestBuilder {
        DigestBuilder::new(
            service,
            store,
            DigestOptions {
                schedule: DigestSchedule::RollingDays(7),
                timeout: Duration::from_secs(5),
                model: Some("summary-model".to_string()),
            },
        )
    }

    // =====================================================================
    // windows
    // =====================================================================

    #[test]
    fn test_rolling_window() {
        let window = DigestSchedule::RollingDays(7).window(at(12, 9));
        assert_eq!(window.since, at(5, 9));
        assert_eq!(window.period, "2025-03-12");
        assert_eq!(window.label, "last 7 days");
    }

    #[test]
    fn test_weekly_window() {
        // Wednesday 2025-03-12; the week started on Monday the 10th.
        let window = DigestSchedule::Weekly(Weekday::Mon).window(at(12, 9));
        assert_eq!(window.since, at(10, 0));
        assert_eq!(window.period, "2025-w10");
        assert_eq!(window.label, "week 10");

        // Early on the start day the previous week is still open.
        let early = DigestSchedule::Weekly(Weekday::Mon).window(at(10, 5));
        assert_eq!(early.since, at(3, 0));
        assert_eq!(early.period, "2025-w09");
        let late = DigestSchedule::Weekly(Weekday::Mon).window(at(10, 7));
        assert_eq!(late.since, at(10, 0));

        let saturday = DigestSchedule::Weekly(Weekday::Sat).window(at(12, 9));
        assert_eq!(saturday.since, at(8, 0));
    }

    #[test]
    fn test_daily_window() {
        let window = DigestSchedule::Daily.window(at(12, 9));
        assert_eq!(window.since, at(12, 0));
        assert_eq!(window.period, "2025-03-12");
        assert_eq!(window.label, "2025-03-12");
    }

    #[test]
    fn test_schedule_from_config() {
        let mut config = DigestConfig::default();
        assert_eq!(
            DigestSchedule::from_config(&config).unwrap(),
            DigestSchedule::RollingDays(7)
        );
        config.schedule = ScheduleKind::Weekly;
        config.start_day = "friday".to_string();
        assert_eq!(
            DigestSchedule::from_config(&config).unwrap(),
            DigestSchedule::Weekly(Weekday::Fri)
        );
        config.start_day = "someday".to_string();
        assert!(DigestSchedule::from_config(&config).is_err());
    }

    // =====================================================================
    // run
    // =====================================================================

    #[tokio::test]
    async fn test_empty_window_records_nothing() {
        let service = Arc::new(MockSummaryService::new());
        let store = Arc::new(MockArtifactStore::new());
        let digests = builder(service.clone(), store.clone());
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        add_analyzed(&mut catalog, "old", "Alpha", 1);
        let pending = catalog.pending().len();

        let report = digests.run_at(&mut catalog, at(12, 9)).await.unwrap();
        assert_eq!(report.considered, 0);
        assert!(!report.changed_anything());
        assert!(service.requests().is_empty());
        assert!(store.puts().is_empty());
        assert!(catalog.pending_digests().is_empty());
        assert_eq!(catalog.pending().len(), pending);
    }

    #[tokio::test]
    async fn test_digest_uploaded_and_recorded() {
        let service = Arc::new(MockSummaryService::new());
        let store = Arc::new(MockArtifactStore::new());
        let digests = builder(service.clone(), store.clone());
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        add_analyzed(&mut catalog, "a", "Alpha", 10);
        add_analyzed(&mut catalog, "b", "Beta", 11);
        add_analyzed(&mut catalog, "old", "Alpha", 1);

        let report = digests.run_at(&mut catalog, at(12, 9)).await.unwrap();
        assert_eq!(report.considered, 2);
        assert_eq!(report.succeeded, 1);

        let requests = service.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model.as_deref(), Some("summary-model"));
        assert_eq!(requests[0].channels(), vec!["Alpha", "Beta"]);

        let history = catalog.digests("2025-03-12");
        assert_eq!(history.len(), 1);
        let digest = &history[0];
        assert_eq!(digest.sources.len(), 2);
        assert!(digest.summary.contains("Video a (Alpha)"));
        let json_key = format!("digests/2025-03-12/{}.json", digest.id);
        assert_eq!(digest.location, Some(format!("mock://{}", json_key)));

        let objects = store.puts();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].key, json_key);
        assert_eq!(objects[1].content_type, MARKDOWN_CONTENT_TYPE);
        let markdown = String::from_utf8(objects[1].body.clone()).unwrap();
        assert!(markdown.starts_with("# Digest 2025-03-12 (last 7 days)"));
        assert!(markdown.contains("2 videos from 2 channels"));
        assert!(catalog.snapshot().validate().is_ok());
    }

    #[tokio::test]
    async fn test_rerun_without_new_results_is_skipped() {
        let service = Arc::new(MockSummaryService::new());
        let store = Arc::new(MockArtifactStore::new());
        let digests = builder(service.clone(), store.clone());
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        add_analyzed(&mut catalog, "a", "Alpha", 10);

        digests.run_at(&mut catalog, at(12, 9)).await.unwrap();
        let again = digests.run_at(&mut catalog, at(12, 18)).await.unwrap();
        assert_eq!(again.skipped, 1);
        assert!(!again.changed_anything());
        assert_eq!(service.requests().len(), 1);
        assert_eq!(store.puts().len(), 2);
        assert_eq!(catalog.digests("2025-03-12").len(), 1);
    }

    #[tokio::test]
    async fn test_new_result_appends_to_period() {
        let service = Arc::new(MockSummaryService::new());
        let store = Arc::new(MockArtifactStore::new());
        let digests = builder(service.clone(), store.clone());
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        add_analyzed(&mut catalog, "a", "Alpha", 10);
        digests.run_at(&mut catalog, at(12, 9)).await.unwrap();

        add_analyzed(&mut catalog, "b", "Beta", 12);
        let report = digests.run_at(&mut catalog, at(12, 18)).await.unwrap();
        assert_eq!(report.succeeded, 1);

        let history = catalog.digests("2025-03-12");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].sources.len(), 1);
        assert_eq!(history[1].sources.len(), 2);
        assert_eq!(catalog.pending_digests().len(), 2);
    }

    #[tokio::test]
    async fn test_summary_failure_is_counted() {
        let store = Arc::new(MockArtifactStore::new());
        let digests = builder(Arc::new(MockSummaryService::failing()), store.clone());
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        add_analyzed(&mut catalog, "a", "Alpha", 10);

        let report = digests.run_at(&mut catalog, at(12, 9)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(store.puts().is_empty());
        assert!(catalog.pending_digests().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_leaves_no_digest() {
        let store = Arc::new(MockArtifactStore::new().failing("digests"));
        let digests = builder(Arc::new(MockSummaryService::new()), store);
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        add_analyzed(&mut catalog, "a", "Alpha", 10);

        let report = digests.run_at(&mut catalog, at(12, 9)).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(catalog.digests("2025-03-12").is_empty());
    }
}
