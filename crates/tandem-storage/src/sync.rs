//! Pull / replay / validate / commit cycle against the shared store.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use tandem_catalog::{replay_changeset, CatalogStore, DroppedMutation};
use tandem_core::config::SyncConfig;
use tandem_core::{Result, TandemError};

use crate::store::{CommitOutcome, Revision, VersionedStore};

/// Maximum sync cycles before giving up with a conflict.
pub const DEFAULT_SYNC_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub max_attempts: u32,
    /// Linear backoff unit: attempt `n` waits `n * backoff` before retrying.
    pub backoff: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SYNC_MAX_ATTEMPTS,
            backoff: Duration::from_millis(250),
        }
    }
}

impl From<&SyncConfig> for SyncPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
        }
    }
}

/// A pulled catalog ready for local mutation.
pub struct WorkingCopy {
    pub revision: Revision,
    pub catalog: CatalogStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing survived replay, or the merge changed nothing.
    UpToDate {
        revision: Revision,
        dropped: Vec<DroppedMutation>,
    },
    Committed {
        revision: Revision,
        applied: usize,
        dropped: Vec<DroppedMutation>,
        attempts: u32,
    },
}

impl SyncOutcome {
    pub fn revision(&self) -> &Revision {
        match self {
            SyncOutcome::UpToDate { revision, .. } | SyncOutcome::Committed { revision, .. } => {
                revision
            }
        }
    }

    pub fn dropped(&self) -> &[DroppedMutation] {
        match self {
            SyncOutcome::UpToDate { dropped, .. } | SyncOutcome::Committed { dropped, .. } => {
                dropped
            }
        }
    }
}

pub struct StateSync {
    store: Arc<dyn VersionedStore>,
    policy: SyncPolicy,
}

impl StateSync {
    pub fn new(store: Arc<dyn VersionedStore>, policy: SyncPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Pull the latest snapshot and open it as a catalog.
    ///
    /// A snapshot that fails validation is refused outright.
    pub async fn checkout(&self) -> Result<WorkingCopy> {
        let checkout = self.store.pull().await?;
        checkout.snapshot.validate()?;
        info!(
            store = self.store.name(),
            revision = %checkout.revision,
            videos = checkout.snapshot.videos.len(),
            "Checked out pipeline state"
        );
        Ok(WorkingCopy {
            revision: checkout.revision,
            catalog: CatalogStore::new(checkout.snapshot),
        })
    }

    /// Commit the catalog's pending changeset.
    ///
    /// Each cycle pulls the latest snapshot, replays the changeset onto it,
    /// validates the merge as a whole and commits it against the pulled
    /// revision. If the store advanced in between, the cycle repeats with
    /// linear backoff until `max_attempts` is exhausted.
    pub async fn commit(&self, catalog: CatalogStore, message: &str) -> Result<SyncOutcome> {
        let (_, pending) = catalog.into_parts();

        for attempt in 1..=self.policy.max_attempts {
            let checkout = self.store.pull().await?;
            let base = checkout.snapshot;
            if pending.is_empty() {
                return Ok(SyncOutcome::UpToDate {
                    revision: checkout.revision,
                    dropped: Vec::new(),
                });
            }

            let (merged, report) = replay_changeset(&base, &pending)?;
            for dropped in &report.dropped {
                debug!(
                    video_id = %dropped.video_id,
                    kind = dropped.kind,
                    reason = %dropped.reason,
                    "Mutation superseded by remote state"
                );
            }
            if report.skipped_digests > 0 {
                debug!(
                    skipped = report.skipped_digests,
                    "Digests already recorded by remote state"
                );
            }
            if report.applied == 0 || merged == base {
                info!(
                    revision = %checkout.revision,
                    dropped = report.dropped.len(),
                    "No changes left to commit"
                );
                return Ok(SyncOutcome::UpToDate {
                    revision: checkout.revision,
                    dropped: report.dropped,
                });
            }

            merged.validate()?;
            merged.validate_successor(&base)?;

            match self
                .store
                .commit(&checkout.revision, &merged, message)
                .await?
            {
                CommitOutcome::Committed(revision) => {
                    info!(
                        %revision,
                        attempt,
                        applied = report.applied,
                        dropped = report.dropped.len(),
                        "Committed pipeline state"
                    );
                    return Ok(SyncOutcome::Committed {
                        revision,
                        applied: report.applied,
                        dropped: report.dropped,
                        attempts: attempt,
                    });
                }
                CommitOutcome::Rejected => {
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        base = %checkout.revision,
                        "Store advanced during commit, retrying"
                    );
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.backoff * attempt).await;
                    }
                }
            }
        }

        Err(TandemError::SyncConflict {
            attempts: self.policy.max_attempts,
        })
    }
}
