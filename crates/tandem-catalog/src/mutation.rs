//! Mutation changeset and replay.
//!
//! Every accepted catalog change is recorded as a `Mutation`. StateSync
//! replays the changeset onto the latest pulled snapshot: a mutation whose
//! precondition no longer holds is dropped, and so is every later mutation
//! for the same video.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use tandem_core::types::{
    AnalysisResult, AnalysisStatus, PublishStatus, SourceMeta, Stage, TranscriptBlob,
    TranscriptStatus, VideoId, VideoRecord,
};

use crate::error::CatalogError;
use crate::snapshot::PipelineSnapshot;
use crate::state_machine::{validate_transition, Cas, StatusChange, StatusField};

/// A status and attempt count as observed by a stage before it acted.
///
/// Both must still match when the mutation is applied, so a retried item
/// that another run already moved on is detected even when the status is
/// the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seen<S> {
    pub status: S,
    pub attempts: u32,
}

impl<S: StatusField> Seen<S> {
    pub fn of(record: &VideoRecord) -> Self {
        Self {
            status: S::current(record),
            attempts: record.attempts(S::STAGE),
        }
    }

    fn check(&self, record: &VideoRecord) -> Option<Cas> {
        let now = Self::of(record);
        if now == *self {
            None
        } else {
            Some(Cas::conflict(
                format!("{}#{}", self.status, self.attempts),
                format!("{}#{}", now.status, now.attempts),
            ))
        }
    }
}

/// One recorded catalog change.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub video_id: VideoId,
    pub at: DateTime<Utc>,
    pub kind: MutationKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationKind {
    /// Insert a newly seen video or refresh its feed metadata.
    Discovered { source: SourceMeta },
    TranscriptFetched {
        seen: Seen<TranscriptStatus>,
        transcript: TranscriptBlob,
    },
    TranscriptFailed {
        seen: Seen<TranscriptStatus>,
        error: String,
        abandon: bool,
    },
    Analyzed {
        seen: Seen<AnalysisStatus>,
        result: AnalysisResult,
        raw: Option<String>,
    },
    AnalysisFailed {
        seen: Seen<AnalysisStatus>,
        error: String,
        abandon: bool,
    },
    /// `result_id` names the result that was uploaded.
    Published {
        seen: Seen<PublishStatus>,
        result_id: Uuid,
        location: String,
    },
    PublishFailed {
        seen: Seen<PublishStatus>,
        error: String,
        abandon: bool,
    },
    Swept,
    /// Operator reset of an exhausted stage.
    Requeued { stage: Stage, attempts: u32 },
    /// Operator request to analyze an unpublished video again.
    Reanalysis { seen: Seen<AnalysisStatus> },
    /// Plain compare-and-swap of one status field.
    Transitioned { change: StatusChange },
}

impl MutationKind {
    pub fn name(&self) -> &'static str {
        match self {
            MutationKind::Discovered { .. } => "discovered",
            MutationKind::TranscriptFetched { .. } => "transcript_fetched",
            MutationKind::TranscriptFailed { .. } => "transcript_failed",
            MutationKind::Analyzed { .. } => "analyzed",
            MutationKind::AnalysisFailed { .. } => "analysis_failed",
            MutationKind::Published { .. } => "published",
            MutationKind::PublishFailed { .. } => "publish_failed",
            MutationKind::Swept => "swept",
            MutationKind::Requeued { .. } => "requeued",
            MutationKind::Reanalysis { .. } => "reanalysis",
            MutationKind::Transitioned { .. } => "transitioned",
        }
    }
}

impl Mutation {
    pub fn new(video_id: VideoId, at: DateTime<Utc>, kind: MutationKind) -> Self {
        Self { video_id, at, kind }
    }

    /// Apply this mutation to `snapshot`.
    ///
    /// All preconditions are checked before anything is written, so a
    /// conflict or an error leaves the snapshot untouched.
    pub fn apply_to(&self, snapshot: &mut PipelineSnapshot) -> Result<Cas, CatalogError> {
        let id = &self.video_id;

        if let MutationKind::Discovered { source } = &self.kind {
            return apply_discovered(snapshot, id, source, self.at);
        }

        let record = snapshot
            .videos
            .get(id)
            .ok_or_else(|| CatalogError::NotFound(id.clone()))?;
        if record.is_swept() {
            return Ok(Cas::conflict("unswept", "swept"));
        }

        match &self.kind {
            MutationKind::Discovered { .. } => Ok(Cas::Applied),

            MutationKind::TranscriptFetched { seen, transcript } => {
                if let Some(conflict) = seen.check(record) {
                    return Ok(conflict);
                }
                validate_transition(seen.status, TranscriptStatus::Fetched)?;
                let record = record_mut(snapshot, id)?;
                record.transcript_status = TranscriptStatus::Fetched;
                record.fetch_attempts += 1;
                record.transcript_fetched_at = Some(transcript.fetched_at);
                record.last_error = None;
                snapshot.transcripts.insert(id.clone(), transcript.clone());
                Ok(Cas::Applied)
            }

            MutationKind::TranscriptFailed {
                seen,
                error,
                abandon,
            } => {
                if let Some(conflict) = seen.check(record) {
                    return Ok(conflict);
                }
                validate_transition(seen.status, TranscriptStatus::FetchFailed)?;
                let at = self.at;
                let record = record_mut(snapshot, id)?;
                record.transcript_status = TranscriptStatus::FetchFailed;
                record.fetch_attempts += 1;
                record.last_error = Some(error.clone());
                if *abandon {
                    record.abandoned_at = Some(at);
                }
                Ok(Cas::Applied)
            }

            MutationKind::Analyzed { seen, result, raw } => {
                if let Some(conflict) = seen.check(record) {
                    return Ok(conflict);
                }
                validate_transition(seen.status, AnalysisStatus::Analyzed)?;
                require_transcript(snapshot, record)?;
                if &result.video_id != id {
                    return Err(CatalogError::InvariantViolation(format!(
                        "result for {} recorded against {}",
                        result.video_id, id
                    )));
                }
                let at = self.at;
                let record = record_mut(snapshot, id)?;
                record.analysis_status = AnalysisStatus::Analyzed;
                record.analysis_attempts += 1;
                record.analyzed_at = Some(at);
                record.last_error = None;
                snapshot
                    .analyses
                    .entry(id.clone())
                    .or_default()
                    .push(result.clone());
                if let Some(raw) = raw {
                    snapshot.scratch.insert(id.clone(), raw.clone());
                }
                Ok(Cas::Applied)
            }

            MutationKind::AnalysisFailed {
                seen,
                error,
                abandon,
            } => {
                if let Some(conflict) = seen.check(record) {
                    return Ok(conflict);
                }
                validate_transition(seen.status, AnalysisStatus::AnalysisFailed)?;
                if record.transcript_status != TranscriptStatus::Fetched {
                    return Err(CatalogError::InvariantViolation(format!(
                        "analysis of {} attempted with transcript {}",
                        id, record.transcript_status
                    )));
                }
                let at = self.at;
                let record = record_mut(snapshot, id)?;
                record.analysis_status = AnalysisStatus::AnalysisFailed;
                record.analysis_attempts += 1;
                record.last_error = Some(error.clone());
                if *abandon {
                    record.abandoned_at = Some(at);
                }
                Ok(Cas::Applied)
            }

            MutationKind::Published {
                seen,
                result_id,
                location,
            } => {
                if let Some(conflict) = seen.check(record) {
                    return Ok(conflict);
                }
                validate_transition(seen.status, PublishStatus::Published)?;
                // The uploaded artifact is stale if the video was re-analyzed
                // since it was built.
                if record.analysis_status != AnalysisStatus::Analyzed {
                    return Ok(Cas::conflict(
                        AnalysisStatus::Analyzed,
                        record.analysis_status,
                    ));
                }
                let latest = snapshot.latest_result(id).map(|r| r.id);
                if latest != Some(*result_id) {
                    return Ok(Cas::conflict(
                        format!("result {}", result_id),
                        match latest {
                            Some(latest) => format!("result {}", latest),
                            None => "no result".to_string(),
                        },
                    ));
                }
                let at = self.at;
                let record = record_mut(snapshot, id)?;
                record.publish_status = PublishStatus::Published;
                record.publish_attempts += 1;
                record.artifact_uploaded_at = Some(at);
                record.artifact_location = Some(location.clone());
                record.last_error = None;
                Ok(Cas::Applied)
            }

            MutationKind::PublishFailed {
                seen,
                error,
                abandon,
            } => {
                if let Some(conflict) = seen.check(record) {
                    return Ok(conflict);
                }
                validate_transition(seen.status, PublishStatus::Unpublished)?;
                let at = self.at;
                let record = record_mut(snapshot, id)?;
                record.publish_attempts += 1;
                record.last_error = Some(error.clone());
                if *abandon {
                    record.abandoned_at = Some(at);
                }
                Ok(Cas::Applied)
            }

            MutationKind::Swept => {
                if record.publish_status != PublishStatus::Published && !record.is_abandoned() {
                    return Ok(Cas::conflict(
                        "published or abandoned",
                        record.publish_status,
                    ));
                }
                let at = self.at;
                snapshot.transcripts.remove(id);
                snapshot.scratch.remove(id);
                let record = record_mut(snapshot, id)?;
                record.swept_at = Some(at);
                Ok(Cas::Applied)
            }

            MutationKind::Requeued { stage, attempts } => {
                if record.attempts(*stage) != *attempts {
                    return Ok(Cas::conflict(
                        format!("{} attempts", attempts),
                        format!("{} attempts", record.attempts(*stage)),
                    ));
                }
                let record = record_mut(snapshot, id)?;
                match stage {
                    Stage::Transcript => {
                        if record.transcript_status != TranscriptStatus::FetchFailed {
                            return Ok(Cas::conflict(
                                TranscriptStatus::FetchFailed,
                                record.transcript_status,
                            ));
                        }
                        record.transcript_status = TranscriptStatus::Missing;
                        record.fetch_attempts = 0;
                    }
                    Stage::Analysis => {
                        if record.analysis_status != AnalysisStatus::AnalysisFailed {
                            return Ok(Cas::conflict(
                                AnalysisStatus::AnalysisFailed,
                                record.analysis_status,
                            ));
                        }
                        record.analysis_status = AnalysisStatus::Pending;
                        record.analysis_attempts = 0;
                    }
                    Stage::Publish => {
                        if record.publish_status != PublishStatus::Unpublished {
                            return Ok(Cas::conflict(
                                PublishStatus::Unpublished,
                                record.publish_status,
                            ));
                        }
                        record.publish_attempts = 0;
                    }
                }
                record.abandoned_at = None;
                record.last_error = None;
                Ok(Cas::Applied)
            }

            MutationKind::Reanalysis { seen } => {
                if let Some(conflict) = seen.check(record) {
                    return Ok(conflict);
                }
                validate_transition(seen.status, AnalysisStatus::Pending)?;
                if record.publish_status != PublishStatus::Unpublished {
                    return Ok(Cas::conflict(
                        PublishStatus::Unpublished,
                        record.publish_status,
                    ));
                }
                let record = record_mut(snapshot, id)?;
                record.analysis_status = AnalysisStatus::Pending;
                record.analysis_attempts = 0;
                record.abandoned_at = None;
                Ok(Cas::Applied)
            }

            MutationKind::Transitioned { change } => {
                change.validate()?;
                if change.matches(record) {
                    if let Some(reason) = unmet_precondition(snapshot, record, change) {
                        return Ok(Cas::conflict(change, reason));
                    }
                }
                let record = record_mut(snapshot, id)?;
                change.apply(record)
            }
        }
    }
}

fn apply_discovered(
    snapshot: &mut PipelineSnapshot,
    id: &VideoId,
    source: &SourceMeta,
    at: DateTime<Utc>,
) -> Result<Cas, CatalogError> {
    match snapshot.videos.get_mut(id) {
        None => {
            snapshot.videos.insert(
                id.clone(),
                VideoRecord::discovered(id.clone(), source.clone(), at),
            );
            Ok(Cas::Applied)
        }
        Some(existing) if existing.source.channel_id != source.channel_id => {
            Err(CatalogError::InvariantViolation(format!(
                "id {} already belongs to channel {}, refusing reuse by {}",
                id, existing.source.channel_id, source.channel_id
            )))
        }
        Some(existing) => {
            existing.source.channel_name = source.channel_name.clone();
            existing.source.title = source.title.clone();
            if source.published_at.is_some() {
                existing.source.published_at = source.published_at;
            }
            if source.url.is_some() {
                existing.source.url = source.url.clone();
            }
            Ok(Cas::Applied)
        }
    }
}

fn require_transcript(
    snapshot: &PipelineSnapshot,
    record: &VideoRecord,
) -> Result<(), CatalogError> {
    if record.transcript_status != TranscriptStatus::Fetched
        || !snapshot.transcripts.contains_key(&record.id)
    {
        return Err(CatalogError::InvariantViolation(format!(
            "analysis result for {} without a transcript ({})",
            record.id, record.transcript_status
        )));
    }
    Ok(())
}

/// Why `change` would leave `record` inconsistent with the other two status
/// fields or with the stored transcript and results, if it would.
pub(crate) fn unmet_precondition(
    snapshot: &PipelineSnapshot,
    record: &VideoRecord,
    change: &StatusChange,
) -> Option<String> {
    let has_transcript = snapshot.transcripts.contains_key(&record.id);
    match *change {
        StatusChange::Transcript {
            to: TranscriptStatus::Fetched,
            ..
        } if !has_transcript => Some("no stored transcript".to_string()),
        StatusChange::Analysis {
            to: AnalysisStatus::Analyzed | AnalysisStatus::AnalysisFailed,
            ..
        } if record.transcript_status != TranscriptStatus::Fetched || !has_transcript => {
            Some(format!("transcript is {}", record.transcript_status))
        }
        StatusChange::Analysis {
            to: AnalysisStatus::Analyzed,
            ..
        } if snapshot.results(&record.id).is_empty() => Some("no analysis result".to_string()),
        StatusChange::Analysis {
            from: AnalysisStatus::Analyzed,
            to: AnalysisStatus::Pending,
        } if record.publish_status == PublishStatus::Published => {
            Some("artifact already published".to_string())
        }
        StatusChange::Publish {
            to: PublishStatus::Published,
            ..
        } if record.analysis_status != AnalysisStatus::Analyzed => {
            Some(format!("analysis is {}", record.analysis_status))
        }
        _ => None,
    }
}

fn record_mut<'a>(
    snapshot: &'a mut PipelineSnapshot,
    id: &VideoId,
) -> Result<&'a mut VideoRecord, CatalogError> {
    snapshot
        .videos
        .get_mut(id)
        .ok_or_else(|| CatalogError::NotFound(id.clone()))
}

// =============================================================================
// Replay
// =============================================================================

/// A mutation that did not survive replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedMutation {
    pub video_id: VideoId,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: usize,
    pub dropped: Vec<DroppedMutation>,
    /// Digests already covered by one recorded elsewhere.
    pub skipped_digests: usize,
}

/// Replay `pending` onto a copy of `base`.
///
/// Conflicting mutations are dropped along with every later mutation for the
/// same video. Errors (illegal edges, invariant violations, unknown ids)
/// abort the replay.
pub fn replay(
    base: &PipelineSnapshot,
    pending: &[Mutation],
) -> Result<(PipelineSnapshot, ReplayReport), CatalogError> {
    let mut snapshot = base.clone();
    let mut report = ReplayReport::default();
    let mut tainted: HashSet<&VideoId> = HashSet::new();

    for mutation in pending {
        if tainted.contains(&mutation.video_id) {
            report.dropped.push(DroppedMutation {
                video_id: mutation.video_id.clone(),
                kind: mutation.kind.name(),
                reason: "earlier mutation for this video was dropped".to_string(),
            });
            continue;
        }
        match mutation.apply_to(&mut snapshot)? {
            Cas::Applied => report.applied += 1,
            Cas::Conflict { expected, found } => {
                debug!(
                    video_id = %mutation.video_id,
                    kind = mutation.kind.name(),
                    %expected,
                    %found,
                    "Dropping mutation on replay"
                );
                tainted.insert(&mutation.video_id);
                report.dropped.push(DroppedMutation {
                    video_id: mutation.video_id.clone(),
                    kind: mutation.kind.name(),
                    reason: format!("expected {}, found {}", expected, found),
                });
            }
        }
    }

    Ok((snapshot, report))
}
