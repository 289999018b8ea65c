//! Per-field state machine with compare-and-swap transitions.
//!
//! Each of the three status fields of a `VideoRecord` is its own CAS domain:
//!
//! transcript: missing -> fetched | fetch_failed, fetch_failed -> fetched |
//!             fetch_failed | missing
//! analysis:   pending -> analyzed | analysis_failed, analysis_failed ->
//!             analyzed | analysis_failed | pending, analyzed -> pending
//! publish:    unpublished -> published | unpublished

use std::fmt;

use serde::{Deserialize, Serialize};
use tandem_core::types::{AnalysisStatus, PublishStatus, Stage, TranscriptStatus, VideoRecord};

use crate::error::CatalogError;

/// Outcome of a compare-and-swap against the current record state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cas {
    Applied,
    /// The stored state differed from what the caller observed.
    Conflict { expected: String, found: String },
}

impl Cas {
    pub fn is_applied(&self) -> bool {
        matches!(self, Cas::Applied)
    }

    pub(crate) fn conflict(expected: impl fmt::Display, found: impl fmt::Display) -> Self {
        Cas::Conflict {
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

/// A status type that owns one field of `VideoRecord`.
pub trait StatusField: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {
    const STAGE: Stage;

    fn current(record: &VideoRecord) -> Self;

    fn set(record: &mut VideoRecord, to: Self);

    fn is_allowed(from: Self, to: Self) -> bool;

    fn change(from: Self, to: Self) -> StatusChange;
}

impl StatusField for TranscriptStatus {
    const STAGE: Stage = Stage::Transcript;

    fn current(record: &VideoRecord) -> Self {
        record.transcript_status
    }

    fn set(record: &mut VideoRecord, to: Self) {
        record.transcript_status = to;
    }

    fn is_allowed(from: Self, to: Self) -> bool {
        use TranscriptStatus::*;
        matches!(
            (from, to),
            (Missing, Fetched)
                | (Missing, FetchFailed)
                | (FetchFailed, Fetched)
                | (FetchFailed, FetchFailed)
                | (FetchFailed, Missing)
        )
    }

    fn change(from: Self, to: Self) -> StatusChange {
        StatusChange::Transcript { from, to }
    }
}

impl StatusField for AnalysisStatus {
    const STAGE: Stage = Stage::Analysis;

    fn current(record: &VideoRecord) -> Self {
        record.analysis_status
    }

    fn set(record: &mut VideoRecord, to: Self) {
        record.analysis_status = to;
    }

    fn is_allowed(from: Self, to: Self) -> bool {
        use AnalysisStatus::*;
        matches!(
            (from, to),
            (Pending, Analyzed)
                | (Pending, AnalysisFailed)
                | (AnalysisFailed, Analyzed)
                | (AnalysisFailed, AnalysisFailed)
                | (AnalysisFailed, Pending)
                | (Analyzed, Pending)
        )
    }

    fn change(from: Self, to: Self) -> StatusChange {
        StatusChange::Analysis { from, to }
    }
}

impl StatusField for PublishStatus {
    const STAGE: Stage = Stage::Publish;

    fn current(record: &VideoRecord) -> Self {
        record.publish_status
    }

    fn set(record: &mut VideoRecord, to: Self) {
        record.publish_status = to;
    }

    fn is_allowed(from: Self, to: Self) -> bool {
        use PublishStatus::*;
        matches!((from, to), (Unpublished, Published) | (Unpublished, Unpublished))
    }

    fn change(from: Self, to: Self) -> StatusChange {
        StatusChange::Publish { from, to }
    }
}

/// Validate that a status transition is an allowed edge.
pub fn validate_transition<S: StatusField>(from: S, to: S) -> Result<(), CatalogError> {
    if S::is_allowed(from, to) {
        Ok(())
    } else {
        Err(CatalogError::InvalidTransition {
            stage: S::STAGE,
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Compare-and-swap one status field of `record`.
///
/// The edge is validated first, so an illegal request is an error even when
/// the stored state would also conflict.
pub fn compare_and_swap<S: StatusField>(
    record: &mut VideoRecord,
    from: S,
    to: S,
) -> Result<Cas, CatalogError> {
    validate_transition(from, to)?;
    let found = S::current(record);
    if found != from {
        return Ok(Cas::conflict(from, found));
    }
    S::set(record, to);
    Ok(Cas::Applied)
}

/// A type-erased transition, as stored in a mutation changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StatusChange {
    Transcript {
        from: TranscriptStatus,
        to: TranscriptStatus,
    },
    Analysis {
        from: AnalysisStatus,
        to: AnalysisStatus,
    },
    Publish {
        from: PublishStatus,
        to: PublishStatus,
    },
}

impl StatusChange {
    pub fn stage(&self) -> Stage {
        match self {
            StatusChange::Transcript { .. } => Stage::Transcript,
            StatusChange::Analysis { .. } => Stage::Analysis,
            StatusChange::Publish { .. } => Stage::Publish,
        }
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        match *self {
            StatusChange::Transcript { from, to } => validate_transition(from, to),
            StatusChange::Analysis { from, to } => validate_transition(from, to),
            StatusChange::Publish { from, to } => validate_transition(from, to),
        }
    }

    /// Whether `record` currently holds the `from` side of this change.
    pub fn matches(&self, record: &VideoRecord) -> bool {
        match *self {
            StatusChange::Transcript { from, .. } => record.transcript_status == from,
            StatusChange::Analysis { from, .. } => record.analysis_status == from,
            StatusChange::Publish { from, .. } => record.publish_status == from,
        }
    }

    pub fn apply(&self, record: &mut VideoRecord) -> Result<Cas, CatalogError> {
        match *self {
            StatusChange::Transcript { from, to } => compare_and_swap(record, from, to),
            StatusChange::Analysis { from, to } => compare_and_swap(record, from, to),
            StatusChange::Publish { from, to } => compare_and_swap(record, from, to),
        }
    }
}

impl fmt::Display for StatusChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusChange::Transcript { from, to } => write!(f, "transcript {} -> {}", from, to),
            StatusChange::Analysis { from, to } => write!(f, "analysis {} -> {}", from, to),
            StatusChange::Publish { from, to } => write!(f, "publish {} -> {}", from, to),
        }
    }
}
