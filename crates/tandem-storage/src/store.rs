use std::fmt;

use async_trait::async_trait;
use tandem_catalog::PipelineSnapshot;

use crate::error::StorageError;

/// Opaque revision identifier of a versioned store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Revision of a store that has never been committed to.
    pub fn initial() -> Self {
        Self("initial".to_string())
    }

    pub fn is_initial(&self) -> bool {
        self.0 == "initial"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A pulled snapshot together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Checkout {
    pub revision: Revision,
    pub snapshot: PipelineSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Revision),
    /// The store advanced past `base`; nothing was written.
    Rejected,
}

/// A store of whole-snapshot revisions with compare-and-swap commits.
///
/// `commit` must be atomic: either the full snapshot becomes the new head,
/// or the store is left exactly as it was.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    fn name(&self) -> &str;

    async fn pull(&self) -> Result<Checkout, StorageError>;

    async fn commit(
        &self,
        base: &Revision,
        snapshot: &PipelineSnapshot,
        message: &str,
    ) -> Result<CommitOutcome, StorageError>;
}
