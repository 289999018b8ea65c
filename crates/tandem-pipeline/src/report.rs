use std::fmt;

use tandem_storage::SyncOutcome;

/// Per-stage counters. Per-video failures end up here, never in an `Err`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub name: &'static str,
    pub considered: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Subset of `failed` that exhausted the retry budget.
    pub abandoned: usize,
    /// Results discarded because the local record moved on.
    pub conflicts: usize,
    pub skipped: usize,
    pub bytes_freed: u64,
}

impl StageReport {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    pub fn changed_anything(&self) -> bool {
        self.succeeded > 0 || self.failed > 0
    }
}

impl fmt::Display for StageReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} considered, {} ok, {} failed",
            self.name, self.considered, self.succeeded, self.failed
        )?;
        if self.abandoned > 0 {
            write!(f, " ({} abandoned)", self.abandoned)?;
        }
        if self.conflicts > 0 {
            write!(f, ", {} conflicts", self.conflicts)?;
        }
        if self.skipped > 0 {
            write!(f, ", {} skipped", self.skipped)?;
        }
        if self.bytes_freed > 0 {
            write!(f, ", {} bytes freed", self.bytes_freed)?;
        }
        Ok(())
    }
}

/// Outcome of one environment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    pub sync: SyncOutcome,
}

impl RunReport {
    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn committed(&self) -> bool {
        matches!(self.sync, SyncOutcome::Committed { .. })
    }
}

/// Commit message summarizing what a run did.
pub fn commit_message(label: &str, stages: &[StageReport]) -> String {
    let parts: Vec<String> = stages
        .iter()
        .filter(|s| s.changed_anything())
        .map(|s| format!("{} {} ok/{} failed", s.name, s.succeeded, s.failed))
        .collect();
    if parts.is_empty() {
        format!("tandem {}", label)
    } else {
        format!("tandem {}: {}", label, parts.join(", "))
    }
}
