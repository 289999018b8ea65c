//! Digest history of a snapshot.
//!
//! Digests are grouped by period and only ever appended. A digest is
//! redundant, and skipped, when the latest digest of its period was built
//! from the same analysis results.

use tracing::debug;

use tandem_core::types::{validate_period, Digest};

use crate::error::CatalogError;
use crate::mutation::{replay, Mutation, ReplayReport};
use crate::snapshot::PipelineSnapshot;
use crate::state_machine::Cas;

/// Everything a run recorded, in the order it was recorded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    pub mutations: Vec<Mutation>,
    pub digests: Vec<Digest>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.digests.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len() + self.digests.len()
    }
}

/// Append `digest` to its period.
pub fn apply_digest(snapshot: &mut PipelineSnapshot, digest: &Digest) -> Result<Cas, CatalogError> {
    validate_period(&digest.period).map_err(CatalogError::InvariantViolation)?;
    if digest.sources.is_empty() {
        return Err(CatalogError::InvariantViolation(format!(
            "digest {} for {} has no sources",
            digest.id, digest.period
        )));
    }
    for source in &digest.sources {
        let known = snapshot
            .results(&source.video_id)
            .iter()
            .any(|r| r.id == source.result_id);
        if !known {
            return Err(CatalogError::InvariantViolation(format!(
                "digest {} cites unknown result {} of {}",
                digest.id, source.result_id, source.video_id
            )));
        }
    }

    let history = snapshot.digests(&digest.period);
    if history.iter().any(|d| d.id == digest.id) {
        return Ok(Cas::conflict("new digest", format!("digest {}", digest.id)));
    }
    if let Some(latest) = history.last() {
        if latest.covers(&digest.sources) {
            return Ok(Cas::conflict(
                "new results",
                format!("digest {} with the same results", latest.id),
            ));
        }
    }

    snapshot
        .digests
        .entry(digest.period.clone())
        .or_default()
        .push(digest.clone());
    Ok(Cas::Applied)
}

/// Replay a whole changeset onto a copy of `base`: mutations first, then
/// digests. A redundant digest is skipped without affecting anything else.
pub fn replay_changeset(
    base: &PipelineSnapshot,
    changes: &Changeset,
) -> Result<(PipelineSnapshot, ReplayReport), CatalogError> {
    let (mut snapshot, mut report) = replay(base, &changes.mutations)?;
    for digest in &changes.digests {
        match apply_digest(&mut snapshot, digest)? {
            Cas::Applied => report.applied += 1,
            Cas::Conflict { found, .. } => {
                debug!(period = %digest.period, digest = %digest.id, %found, "Skipping digest on replay");
                report.skipped_digests += 1;
            }
        }
    }
    Ok((snapshot, report))
}
