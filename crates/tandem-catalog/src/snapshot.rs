//! Committed pipeline state at one revision of the versioned store.

use std::collections::BTreeMap;

use tandem_core::types::{
    validate_period, AnalysisResult, AnalysisStatus, Digest, PublishStatus, TranscriptBlob,
    TranscriptStatus, VideoId, VideoRecord,
};

use crate::error::CatalogError;
use crate::mutation::Mutation;
use crate::state_machine::Cas;

/// Catalog, analyses, transcript blobs and scratch artifacts, taken together.
///
/// A snapshot is only ever committed as a whole, after `validate` passes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineSnapshot {
    pub videos: BTreeMap<VideoId, VideoRecord>,
    pub analyses: BTreeMap<VideoId, Vec<AnalysisResult>>,
    pub transcripts: BTreeMap<VideoId, TranscriptBlob>,
    /// Raw analysis-service responses, kept until the record is swept.
    pub scratch: BTreeMap<VideoId, String>,
    /// Digest history per period, oldest first.
    pub digests: BTreeMap<String, Vec<Digest>>,
}

impl PipelineSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.videos.is_empty()
    }

    pub fn record(&self, id: &VideoId) -> Option<&VideoRecord> {
        self.videos.get(id)
    }

    pub fn results(&self, id: &VideoId) -> &[AnalysisResult] {
        self.analyses.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The current result is the most recently appended one.
    pub fn latest_result(&self, id: &VideoId) -> Option<&AnalysisResult> {
        self.analyses.get(id).and_then(|results| results.last())
    }

    pub fn digests(&self, period: &str) -> &[Digest] {
        self.digests.get(period).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Most recent digest across all periods.
    pub fn latest_digest(&self) -> Option<&Digest> {
        self.digests
            .values()
            .filter_map(|history| history.last())
            .max_by_key(|d| d.created_at)
    }

    pub fn apply(&mut self, mutation: &Mutation) -> Result<Cas, CatalogError> {
        mutation.apply_to(self)
    }

    /// Check every cross-field invariant of this snapshot.
    pub fn validate(&self) -> Result<(), CatalogError> {
        for (key, record) in &self.videos {
            if key != &record.id {
                return violation(format!("record stored under {} has id {}", key, record.id));
            }

            let analysis_started = matches!(
                record.analysis_status,
                AnalysisStatus::Analyzed | AnalysisStatus::AnalysisFailed
            );
            if analysis_started && record.transcript_status != TranscriptStatus::Fetched {
                return violation(format!(
                    "{} is {} but transcript is {}",
                    key, record.analysis_status, record.transcript_status
                ));
            }
            if record.publish_status == PublishStatus::Published
                && record.analysis_status != AnalysisStatus::Analyzed
            {
                return violation(format!(
                    "{} is published but analysis is {}",
                    key, record.analysis_status
                ));
            }
            if record.analysis_status == AnalysisStatus::Analyzed && self.results(key).is_empty() {
                return violation(format!("{} is analyzed but has no result", key));
            }
            if record.is_swept()
                && record.publish_status != PublishStatus::Published
                && !record.is_abandoned()
            {
                return violation(format!("{} was swept before publish", key));
            }
            if record.transcript_status == TranscriptStatus::Fetched
                && !record.is_swept()
                && !self.transcripts.contains_key(key)
            {
                return violation(format!("{} is fetched but its transcript is missing", key));
            }
        }

        for key in self.transcripts.keys() {
            match self.videos.get(key) {
                None => return violation(format!("transcript for unknown video {}", key)),
                Some(record) if record.is_swept() => {
                    return violation(format!("transcript kept for swept video {}", key))
                }
                Some(record) if record.transcript_status != TranscriptStatus::Fetched => {
                    return violation(format!(
                        "transcript stored for {} while status is {}",
                        key, record.transcript_status
                    ))
                }
                Some(_) => {}
            }
        }

        for key in self.scratch.keys() {
            match self.videos.get(key) {
                None => return violation(format!("scratch for unknown video {}", key)),
                Some(record) if record.is_swept() => {
                    return violation(format!("scratch kept for swept video {}", key))
                }
                Some(_) => {}
            }
        }

        for (key, results) in &self.analyses {
            let Some(record) = self.videos.get(key) else {
                return violation(format!("analysis results for unknown video {}", key));
            };
            if !results.is_empty() && record.transcript_status != TranscriptStatus::Fetched {
                return violation(format!("analysis result for {} without a transcript", key));
            }
            if let Some(stray) = results.iter().find(|r| &r.video_id != key) {
                return violation(format!(
                    "result {} for {} is stored under {}",
                    stray.id, stray.video_id, key
                ));
            }
        }

        for (period, history) in &self.digests {
            if let Err(msg) = validate_period(period) {
                return violation(msg);
            }
            for digest in history {
                if &digest.period != period {
                    return violation(format!(
                        "digest {} for {} is stored under {}",
                        digest.id, digest.period, period
                    ));
                }
                let dangling = digest.sources.iter().find(|source| {
                    !self
                        .results(&source.video_id)
                        .iter()
                        .any(|r| r.id == source.result_id)
                });
                if let Some(source) = dangling {
                    return violation(format!(
                        "digest {} cites unknown result {} of {}",
                        digest.id, source.result_id, source.video_id
                    ));
                }
            }
        }

        Ok(())
    }

    /// Check that `self` is a legal successor of `previous`.
    ///
    /// Records are never removed and never change channel. Analysis results
    /// are immutable and only appended, and so are digests. A transcript only
    /// disappears when its record is swept.
    pub fn validate_successor(&self, previous: &PipelineSnapshot) -> Result<(), CatalogError> {
        for (id, old) in &previous.videos {
            let Some(new) = self.videos.get(id) else {
                return violation(format!("record {} was removed", id));
            };
            if new.source.channel_id != old.source.channel_id {
                return violation(format!(
                    "id {} reused for channel {} (was {})",
                    id, new.source.channel_id, old.source.channel_id
                ));
            }
        }

        for (id, old_results) in &previous.analyses {
            let new_results = self.results(id);
            if new_results.len() < old_results.len()
                || &new_results[..old_results.len()] != old_results.as_slice()
            {
                return violation(format!("analysis history of {} was rewritten", id));
            }
        }

        for id in previous.transcripts.keys() {
            if !self.transcripts.contains_key(id) {
                let swept = self.videos.get(id).map(|r| r.is_swept()).unwrap_or(false);
                if !swept {
                    return violation(format!("transcript of {} deleted without a sweep", id));
                }
            }
        }

        for (period, old_history) in &previous.digests {
            let new_history = self.digests(period);
            if new_history.len() < old_history.len()
                || &new_history[..old_history.len()] != old_history.as_slice()
            {
                return violation(format!("digest history of {} was rewritten", period));
            }
        }

        Ok(())
    }

    pub fn summary(&self) -> CatalogSummary {
        let mut summary = CatalogSummary {
            videos: self.videos.len(),
            transcripts: self.transcripts.len(),
            transcript_bytes: self.transcripts.values().map(|b| b.len_bytes() as u64).sum(),
            results: self.analyses.values().map(Vec::len).sum(),
            digests: self.digests.values().map(Vec::len).sum(),
            ..CatalogSummary::default()
        };
        for record in self.videos.values() {
            *summary
                .transcript
                .entry(record.transcript_status.to_string())
                .or_default() += 1;
            *summary
                .analysis
                .entry(record.analysis_status.to_string())
                .or_default() += 1;
            *summary
                .publish
                .entry(record.publish_status.to_string())
                .or_default() += 1;
            if record.is_abandoned() {
                summary.abandoned += 1;
            }
            if record.is_swept() {
                summary.swept += 1;
            }
        }
        summary
    }
}

fn violation(msg: String) -> Result<(), CatalogError> {
    Err(CatalogError::InvariantViolation(msg))
}

/// Status counts for a snapshot, as shown by `tandem status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogSummary {
    pub videos: usize,
    pub transcript: BTreeMap<String, usize>,
    pub analysis: BTreeMap<String, usize>,
    pub publish: BTreeMap<String, usize>,
    pub abandoned: usize,
    pub swept: usize,
    pub transcripts: usize,
    pub transcript_bytes: u64,
    pub results: usize,
    pub digests: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tandem_core::types::SourceMeta;

    fn vid(raw: &str) -> VideoId {
        VideoId::parse(raw).unwrap()
    }

    fn source(channel: &str) -> SourceMeta {
        SourceMeta {
            channel_id: channel.to_string(),
            channel_name: "Channel".to_string(),
            title: "Title".to_string(),
            published_at: None,
            url: None,
        }
    }

    fn with_record(id: &str) -> PipelineSnapshot {
        let mut snap = PipelineSnapshot::new();
        snap.videos.insert(
            vid(id),
            VideoRecord::discovered(vid(id), source("c1"), Utc::now()),
        );
        snap
    }

    /// A record carried all the way to published.
    fn published(id: &str) -> PipelineSnapshot {
        let mut snap = with_record(id);
        let record = snap.videos.get_mut(&vid(id)).unwrap();
        record.transcript_status = TranscriptStatus::Fetched;
        record.analysis_status = AnalysisStatus::Analyzed;
        record.publish_status = PublishStatus::Published;
        snap.transcripts
            .insert(vid(id), TranscriptBlob::new("hello world", Utc::now()));
        snap.analyses.insert(
            vid(id),
            vec![AnalysisResult::new(
                vid(id),
                serde_json::json!({"summary": "s"}),
                None,
                Utc::now(),
            )],
        );
        snap
    }

    fn digest_of(snap: &PipelineSnapshot, id: &str, period: &str) -> Digest {
        let result_id = snap.results(&vid(id))[0].id;
        Digest {
            id: uuid::Uuid::new_v4(),
            period: period.to_string(),
            label: period.to_string(),
            since: Utc::now(),
            created_at: Utc::now(),
            model: None,
            summary: "digest".to_string(),
            sources: vec![tandem_core::types::DigestSource {
                video_id: vid(id),
                result_id,
            }],
            channels: vec!["Channel".to_string()],
            location: None,
        }
    }

    fn assert_violation(snap: &PipelineSnapshot, needle: &str) {
        match snap.validate() {
            Err(CatalogError::InvariantViolation(msg)) => {
                assert!(msg.contains(needle), "unexpected message: {}", msg)
            }
            other => panic!("expected invariant violation, got {:?}", other),
        }
    }

    // =====================================================================
    // validate
    // =====================================================================

    #[test]
    fn test_empty_and_fresh_snapshots_are_valid() {
        assert!(PipelineSnapshot::new().validate().is_ok());
        assert!(with_record("v1").validate().is_ok());
        assert!(published("v1").validate().is_ok());
    }

    #[test]
    fn test_analysis_requires_fetched_transcript() {
        let mut snap = with_record("v1");
        snap.videos.get_mut(&vid("v1")).unwrap().analysis_status = AnalysisStatus::AnalysisFailed;
        assert_violation(&snap, "transcript is missing");
    }

    #[test]
    fn test_publish_requires_analysis() {
        let mut snap = published("v1");
        snap.videos.get_mut(&vid("v1")).unwrap().analysis_status = AnalysisStatus::Pending;
        assert_violation(&snap, "is published but analysis is pending");
    }

    #[test]
    fn test_analyzed_requires_result() {
        let mut snap = published("v1");
        snap.analyses.clear();
        assert_violation(&snap, "has no result");
    }

    #[test]
    fn test_fetched_requires_blob_until_swept() {
        let mut snap = published("v1");
        snap.transcripts.clear();
        assert_violation(&snap, "transcript is missing");

        snap.videos.get_mut(&vid("v1")).unwrap().swept_at = Some(Utc::now());
        assert!(snap.validate().is_ok());
    }

    #[test]
    fn test_swept_requires_published_or_abandoned() {
        let mut snap = with_record("v1");
        snap.videos.get_mut(&vid("v1")).unwrap().swept_at = Some(Utc::now());
        assert_violation(&snap, "swept before publish");

        snap.videos.get_mut(&vid("v1")).unwrap().abandoned_at = Some(Utc::now());
        assert!(snap.validate().is_ok());
    }

    #[test]
    fn test_orphan_blob_and_scratch() {
        let mut snap = PipelineSnapshot::new();
        snap.transcripts
            .insert(vid("ghost"), TranscriptBlob::new("x", Utc::now()));
        assert_violation(&snap, "unknown video ghost");

        let mut snap = PipelineSnapshot::new();
        snap.scratch.insert(vid("ghost"), "{}".to_string());
        assert_violation(&snap, "scratch for unknown video");
    }

    #[test]
    fn test_blob_for_unfetched_record() {
        let mut snap = with_record("v1");
        snap.transcripts
            .insert(vid("v1"), TranscriptBlob::new("x", Utc::now()));
        assert_violation(&snap, "while status is missing");
    }

    #[test]
    fn test_key_must_match_record_id() {
        let mut snap = with_record("v1");
        let record = snap.videos.remove(&vid("v1")).unwrap();
        snap.videos.insert(vid("v2"), record);
        assert_violation(&snap, "stored under v2");
    }

    #[test]
    fn test_digest_must_cite_known_results() {
        let mut snap = published("v1");
        let mut digest = digest_of(&snap, "v1", "2025-03-10");
        snap.digests
            .insert("2025-03-10".to_string(), vec![digest.clone()]);
        assert!(snap.validate().is_ok());

        digest.sources[0].result_id = uuid::Uuid::new_v4();
        snap.digests.insert("2025-03-10".to_string(), vec![digest]);
        assert_violation(&snap, "cites unknown result");
    }

    #[test]
    fn test_digest_period_must_match_key() {
        let mut snap = published("v1");
        let digest = digest_of(&snap, "v1", "2025-03-10");
        snap.digests.insert("2025-w10".to_string(), vec![digest]);
        assert_violation(&snap, "is stored under 2025-w10");
    }

    // =====================================================================
    // validate_successor
    // =====================================================================

    #[test]
    fn test_successor_may_not_drop_records() {
        let previous = with_record("v1");
        let next = PipelineSnapshot::new();
        assert!(next.validate_successor(&previous).is_err());
    }

    #[test]
    fn test_successor_may_not_change_channel() {
        let previous = with_record("v1");
        let mut next = previous.clone();
        next.videos.get_mut(&vid("v1")).unwrap().source.channel_id = "other".to_string();
        let err = next.validate_successor(&previous).unwrap_err();
        assert!(err.to_string().contains("reused for channel other"));
    }

    #[test]
    fn test_successor_appends_results_only() {
        let previous = published("v1");
        let mut next = previous.clone();
        next.analyses.get_mut(&vid("v1")).unwrap().push(AnalysisResult::new(
            vid("v1"),
            serde_json::json!({"summary": "second"}),
            None,
            Utc::now(),
        ));
        assert!(next.validate_successor(&previous).is_ok());

        let mut rewritten = previous.clone();
        rewritten.analyses.get_mut(&vid("v1")).unwrap()[0].payload = serde_json::json!({});
        assert!(rewritten.validate_successor(&previous).is_err());
    }

    #[test]
    fn test_successor_blob_removal_needs_sweep() {
        let previous = published("v1");
        let mut next = previous.clone();
        next.transcripts.clear();
        assert!(next.validate_successor(&previous).is_err());

        next.videos.get_mut(&vid("v1")).unwrap().swept_at = Some(Utc::now());
        assert!(next.validate_successor(&previous).is_ok());
    }

    #[test]
    fn test_successor_appends_digests_only() {
        let mut previous = published("v1");
        let first = digest_of(&previous, "v1", "2025-03-10");
        previous
            .digests
            .insert("2025-03-10".to_string(), vec![first]);

        let mut next = previous.clone();
        let second = digest_of(&next, "v1", "2025-03-10");
        next.digests.get_mut("2025-03-10").unwrap().push(second);
        assert!(next.validate_successor(&previous).is_ok());

        let mut dropped = previous.clone();
        dropped.digests.clear();
        let err = dropped.validate_successor(&previous).unwrap_err();
        assert!(err.to_string().contains("digest history of 2025-03-10"));
    }

    // =====================================================================
    // summary
    // =====================================================================

    #[test]
    fn test_summary_counts() {
        let mut snap = published("v1");
        snap.videos.insert(
            vid("v2"),
            VideoRecord::discovered(vid("v2"), source("c1"), Utc::now()),
        );
        let summary = snap.summary();
        assert_eq!(summary.videos, 2);
        assert_eq!(summary.transcript.get("fetched"), Some(&1));
        assert_eq!(summary.transcript.get("missing"), Some(&1));
        assert_eq!(summary.publish.get("published"), Some(&1));
        assert_eq!(summary.results, 1);
        assert_eq!(summary.transcript_bytes, "hello world".len() as u64);
        assert_eq!(summary.swept, 0);
    }
}
