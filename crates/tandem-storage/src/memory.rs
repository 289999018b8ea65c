//! In-process versioned store for tests and embedding.

use async_trait::async_trait;
use tokio::sync::Mutex;

use tandem_catalog::PipelineSnapshot;

use crate::error::StorageError;
use crate::store::{Checkout, CommitOutcome, Revision, VersionedStore};

struct State {
    version: u64,
    snapshot: PipelineSnapshot,
    messages: Vec<String>,
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_snapshot(PipelineSnapshot::new())
    }

    /// A store whose first revision already holds `snapshot`.
    pub fn with_snapshot(snapshot: PipelineSnapshot) -> Self {
        let version = if snapshot.is_empty() { 0 } else { 1 };
        Self {
            state: Mutex::new(State {
                version,
                snapshot,
                messages: Vec::new(),
            }),
        }
    }

    pub async fn revision(&self) -> Revision {
        revision_of(self.state.lock().await.version)
    }

    pub async fn snapshot(&self) -> PipelineSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    /// Commit messages in order, oldest first.
    pub async fn messages(&self) -> Vec<String> {
        self.state.lock().await.messages.clone()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn revision_of(version: u64) -> Revision {
    if version == 0 {
        Revision::initial()
    } else {
        Revision::new(format!("mem-{}", version))
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn pull(&self) -> Result<Checkout, StorageError> {
        let state = self.state.lock().await;
        Ok(Checkout {
            revision: revision_of(state.version),
            snapshot: state.snapshot.clone(),
        })
    }

    async fn commit(
        &self,
        base: &Revision,
        snapshot: &PipelineSnapshot,
        message: &str,
    ) -> Result<CommitOutcome, StorageError> {
        let mut state = self.state.lock().await;
        if &revision_of(state.version) != base {
            return Ok(CommitOutcome::Rejected);
        }
        state.version += 1;
        state.snapshot = snapshot.clone();
        state.messages.push(message.to_string());
        Ok(CommitOutcome::Committed(revision_of(state.version)))
    }
}
