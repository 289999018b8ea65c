//! Retention sweeping (environment B).

use chrono::Utc;
use tracing::{debug, info};

use tandem_catalog::{CatalogStore, StatusPredicate};
use tandem_core::types::{PublishStatus, VideoRecord};
use tandem_core::Result;

use crate::report::StageReport;

/// Deletes transcripts and scratch data that are no longer needed.
///
/// Published records are always eligible. Abandoned records are eligible
/// only when `sweep_abandoned` is set. Unpublished, unabandoned records are
/// never touched.
#[derive(Debug, Clone, Copy)]
pub struct RetentionSweeper {
    sweep_abandoned: bool,
}

impl RetentionSweeper {
    pub fn new(sweep_abandoned: bool) -> Self {
        Self { sweep_abandoned }
    }

    pub fn candidates(&self, catalog: &CatalogStore) -> Vec<VideoRecord> {
        catalog
            .list(&StatusPredicate::any().swept(false))
            .into_iter()
            .filter(|r| {
                r.publish_status == PublishStatus::Published
                    || (self.sweep_abandoned && r.is_abandoned())
            })
            .collect()
    }

    pub fn run(&self, catalog: &mut CatalogStore) -> Result<StageReport> {
        let mut report = StageReport::new("sweep");
        let candidates = self.candidates(catalog);
        report.considered = candidates.len();

        for record in candidates {
            let freed = catalog.sweep(&record.id, Utc::now())?;
            debug!(video_id = %record.id, freed, "Swept");
            report.succeeded += 1;
            report.bytes_freed += freed;
        }

        if report.considered > 0 {
            info!("{}", report);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_catalog::{Mutation, MutationKind, PipelineSnapshot, Seen};
    use tandem_core::types::{AnalysisResult, SourceMeta, TranscriptBlob, VideoId};

    fn vid(raw: &str) -> VideoId {
        VideoId::parse(raw).unwrap()
    }

    fn add(catalog: &mut CatalogStore, id: &str) {
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
    }

    fn fetch(catalog: &mut CatalogStore, id: &str) {
        let record = catalog.get(&vid(id)).unwrap().clone();
        catalog
            .record(Mutation::new(
                vid(id),
                Utc::now(),
                MutationKind::TranscriptFetched {
                    seen: Seen::of(&record),
                    transcript: TranscriptBlob::new("0123456789", Utc::now()),
                },
            ))
            .unwrap();
    }

    fn analyze_and_publish(catalog: &mut CatalogStore, id: &str) {
        let record = catalog.get(&vid(id)).unwrap().clone();
        let result = AnalysisResult::new(vid(id), serde_json::json!({}), None, Utc::now());
        let result_id = result.id;
        catalog
            .record(Mutation::new(
                vid(id),
                Utc::now(),
                MutationKind::Analyzed {
                    seen: Seen::of(&record),
                    result,
                    raw: Some("raw".to_string()),
                },
            ))
            .unwrap();
        let record = catalog.get(&vid(id)).unwrap().clone();
        catalog
            .record(Mutation::new(
                vid(id),
                Utc::now(),
                MutationKind::Published {
                    seen: Seen::of(&record),
                    result_id,
                    location: "loc".to_string(),
                },
            ))
            .unwrap();
    }

    #[test]
    fn test_sweeps_published_only() {
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        add(&mut catalog, "done");
        fetch(&mut catalog, "done");
        analyze_and_publish(&mut catalog, "done");
        add(&mut catalog, "waiting");
        fetch(&mut catalog, "waiting");

        let report = RetentionSweeper::new(true).run(&mut catalog).unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.bytes_freed, 13);
        assert!(catalog.get(&vid("done")).unwrap().is_swept());
        assert!(catalog.transcript(&vid("done")).is_none());
        assert!(!catalog.get(&vid("waiting")).unwrap().is_swept());
        assert!(catalog.transcript(&vid("waiting")).is_some());
        assert!(catalog.snapshot().validate().is_ok());

        let again = RetentionSweeper::new(true).run(&mut catalog).unwrap();
        assert_eq!(again.considered, 0);
    }

    #[test]
    fn test_abandoned_sweep_is_configurable() {
        let mut catalog = CatalogStore::new(PipelineSnapshot::new());
        add(&mut catalog, "gone");
        let record = catalog.get(&vid("gone")).unwrap().clone();
        catalog
            .record(Mutation::new(
                vid("gone"),
                Utc::now(),
                MutationKind::TranscriptFailed {
                    seen: Seen::of(&record),
                    error: "404".to_string(),
                    abandon: true,
                },
            ))
            .unwrap();

        let kept = RetentionSweeper::new(false).run(&mut catalog).unwrap();
        assert_eq!(kept.considered, 0);

        let swept = RetentionSweeper::new(true).run(&mut catalog).unwrap();
        assert_eq!(swept.succeeded, 1);
        assert!(catalog.get(&vid("gone")).unwrap().is_swept());
    }
}
