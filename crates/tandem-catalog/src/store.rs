//! In-memory catalog over one pulled snapshot.
//!
//! Stages read and mutate the catalog through `CatalogStore`. Every accepted
//! change is applied to the local snapshot and appended to the pending
//! changeset, which StateSync later replays onto the latest remote state.
//! Digests travel in the same changeset.

use chrono::{DateTime, Utc};
use tracing::debug;

use tandem_core::types::{
    AnalysisResult, AnalysisStatus, Digest, PublishStatus, SourceMeta, Stage, TranscriptBlob,
    TranscriptStatus, VideoId, VideoRecord,
};

use crate::digest::{apply_digest, Changeset};
use crate::error::CatalogError;
use crate::filter::StatusPredicate;
use crate::mutation::{unmet_precondition, Mutation, MutationKind, Seen};
use crate::snapshot::PipelineSnapshot;
use crate::state_machine::{validate_transition, Cas, StatusField};

/// Outcome of `CatalogStore::upsert`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
    Unchanged,
}

pub struct CatalogStore {
    snapshot: PipelineSnapshot,
    pending: Changeset,
}

impl CatalogStore {
    pub fn new(snapshot: PipelineSnapshot) -> Self {
        Self {
            snapshot,
            pending: Changeset::default(),
        }
    }

    /// Validate a raw identifier coming from outside the catalog.
    pub fn parse_id(raw: &str) -> Result<VideoId, CatalogError> {
        VideoId::parse(raw).map_err(CatalogError::InvalidId)
    }

    pub fn snapshot(&self) -> &PipelineSnapshot {
        &self.snapshot
    }

    pub fn pending(&self) -> &[Mutation] {
        &self.pending.mutations
    }

    pub fn pending_digests(&self) -> &[Digest] {
        &self.pending.digests
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn into_parts(self) -> (PipelineSnapshot, Changeset) {
        (self.snapshot, self.pending)
    }

    pub fn digests(&self, period: &str) -> &[Digest] {
        self.snapshot.digests(period)
    }

    /// Records matching `filter`, newest `published_at` first, ties by id.
    pub fn list(&self, filter: &StatusPredicate) -> Vec<VideoRecord> {
        let mut result: Vec<VideoRecord> = self
            .snapshot
            .videos
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.source
                .published_at
                .cmp(&a.source.published_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        result
    }

    pub fn get(&self, id: &VideoId) -> Result<&VideoRecord, CatalogError> {
        self.snapshot
            .record(id)
            .ok_or_else(|| CatalogError::NotFound(id.clone()))
    }

    pub fn transcript(&self, id: &VideoId) -> Option<&TranscriptBlob> {
        self.snapshot.transcripts.get(id)
    }

    pub fn latest_result(&self, id: &VideoId) -> Option<&AnalysisResult> {
        self.snapshot.latest_result(id)
    }

    /// Insert a new video or refresh the feed metadata of a known one.
    ///
    /// Statuses are never touched. Reusing an id for another channel is
    /// rejected.
    pub fn upsert(
        &mut self,
        id: VideoId,
        source: SourceMeta,
        at: DateTime<Utc>,
    ) -> Result<Upsert, CatalogError> {
        let outcome = match self.snapshot.record(&id) {
            None => Upsert::Inserted,
            Some(existing) => {
                if existing.source.channel_id != source.channel_id {
                    return Err(CatalogError::InvariantViolation(format!(
                        "id {} already belongs to channel {}, refusing reuse by {}",
                        id, existing.source.channel_id, source.channel_id
                    )));
                }
                let current = &existing.source;
                let unchanged = current.title == source.title
                    && current.channel_name == source.channel_name
                    && (source.published_at.is_none()
                        || source.published_at == current.published_at)
                    && (source.url.is_none() || source.url == current.url);
                if unchanged {
                    return Ok(Upsert::Unchanged);
                }
                Upsert::Updated
            }
        };
        self.record(Mutation::new(id, at, MutationKind::Discovered { source }))?;
        Ok(outcome)
    }

    /// Compare-and-swap one status field.
    ///
    /// A move whose edge is legal but which would break the relation to the
    /// other status fields is rejected with `InvariantViolation` and leaves
    /// the catalog unchanged.
    pub fn transition<S: StatusField>(
        &mut self,
        id: &VideoId,
        from: S,
        to: S,
        at: DateTime<Utc>,
    ) -> Result<Cas, CatalogError> {
        validate_transition(from, to)?;
        let change = S::change(from, to);
        let record = self.get(id)?;
        if change.matches(record) {
            if let Some(reason) = unmet_precondition(&self.snapshot, record, &change) {
                return Err(CatalogError::InvariantViolation(format!(
                    "{} of {} rejected: {}",
                    change, id, reason
                )));
            }
        }
        self.record(Mutation::new(
            id.clone(),
            at,
            MutationKind::Transitioned { change },
        ))
    }

    /// Apply a mutation locally and keep it for replay if it was accepted.
    pub fn record(&mut self, mutation: Mutation) -> Result<Cas, CatalogError> {
        let cas = mutation.apply_to(&mut self.snapshot)?;
        match &cas {
            Cas::Applied => self.pending.mutations.push(mutation),
            Cas::Conflict { expected, found } => {
                debug!(
                    video_id = %mutation.video_id,
                    kind = mutation.kind.name(),
                    %expected,
                    %found,
                    "Mutation rejected by local state"
                );
            }
        }
        Ok(cas)
    }

    /// Append a digest to its period.
    ///
    /// A digest built from the same results as the latest one for its period
    /// comes back as a conflict and is not kept.
    pub fn record_digest(&mut self, digest: Digest) -> Result<Cas, CatalogError> {
        let cas = apply_digest(&mut self.snapshot, &digest)?;
        match &cas {
            Cas::Applied => self.pending.digests.push(digest),
            Cas::Conflict { found, .. } => {
                debug!(period = %digest.period, %found, "Digest already recorded");
            }
        }
        Ok(cas)
    }

    /// Operator reset of a stage so it gets a fresh retry budget.
    pub fn requeue(
        &mut self,
        id: &VideoId,
        stage: Stage,
        at: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        let record = self.get(id)?;
        let refuse = |reason: String| CatalogError::InvalidRequeue {
            id: id.clone(),
            stage,
            reason,
        };
        if record.is_swept() {
            return Err(refuse("record was already swept".to_string()));
        }
        match stage {
            Stage::Transcript if record.transcript_status != TranscriptStatus::FetchFailed => {
                return Err(refuse(format!(
                    "transcript is {}",
                    record.transcript_status
                )));
            }
            Stage::Analysis if record.analysis_status != AnalysisStatus::AnalysisFailed => {
                return Err(refuse(format!("analysis is {}", record.analysis_status)));
            }
            Stage::Publish if record.publish_status != PublishStatus::Unpublished => {
                return Err(refuse(format!("publish is {}", record.publish_status)));
            }
            Stage::Publish if record.publish_attempts == 0 && !record.is_abandoned() => {
                return Err(refuse("no failed publish attempts".to_string()));
            }
            _ => {}
        }
        let attempts = record.attempts(stage);
        match self.record(Mutation::new(
            id.clone(),
            at,
            MutationKind::Requeued { stage, attempts },
        ))? {
            Cas::Applied => Ok(()),
            Cas::Conflict { found, .. } => Err(refuse(format!("found {}", found))),
        }
    }

    /// Send an analyzed, unpublished video back to the analysis queue.
    pub fn reanalyze(&mut self, id: &VideoId, at: DateTime<Utc>) -> Result<(), CatalogError> {
        let record = self.get(id)?;
        let refuse = |reason: String| CatalogError::InvalidRequeue {
            id: id.clone(),
            stage: Stage::Analysis,
            reason,
        };
        if record.is_swept() {
            return Err(refuse("record was already swept".to_string()));
        }
        if record.analysis_status != AnalysisStatus::Analyzed {
            return Err(refuse(format!("analysis is {}", record.analysis_status)));
        }
        if record.publish_status != PublishStatus::Unpublished {
            return Err(refuse("artifact already published".to_string()));
        }
        let seen = Seen::<AnalysisStatus>::of(record);
        match self.record(Mutation::new(
            id.clone(),
            at,
            MutationKind::Reanalysis { seen },
        ))? {
            Cas::Applied => Ok(()),
            Cas::Conflict { found, .. } => Err(refuse(format!("found {}", found))),
        }
    }

    /// Delete the transcript and scratch of a published (or abandoned)
    /// record and mark it swept. Returns the number of bytes freed.
    pub fn sweep(&mut self, id: &VideoId, at: DateTime<Utc>) -> Result<u64, CatalogError> {
        let record = self.get(id)?;
        if record.is_swept() {
            return Ok(0);
        }
        if record.publish_status != PublishStatus::Published && !record.is_abandoned() {
            return Err(CatalogError::InvariantViolation(format!(
                "refusing to sweep unpublished video {}",
                id
            )));
        }
        let freed = self
            .snapshot
            .transcripts
            .get(id)
            .map(|blob| blob.len_bytes() as u64)
            .unwrap_or(0)
            + self
                .snapshot
                .scratch
                .get(id)
                .map(|raw| raw.len() as u64)
                .unwrap_or(0);
        match self.record(Mutation::new(id.clone(), at, MutationKind::Swept))? {
            Cas::Applied => Ok(freed),
            Cas::Conflict { expected, found } => Err(CatalogError::InvariantViolation(format!(
                "sweep of {} rejected: expected {}, found {}",
                id, expected, found
            ))),
        }
    }
}
