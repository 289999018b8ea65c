//! Record filters for `CatalogStore::list`.

use tandem_core::types::{AnalysisStatus, PublishStatus, TranscriptStatus, VideoRecord};

/// Conjunction of optional constraints on a `VideoRecord`.
///
/// An empty status set means "any status". Multiple statuses for the same
/// field are alternatives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusPredicate {
    transcript: Vec<TranscriptStatus>,
    analysis: Vec<AnalysisStatus>,
    publish: Vec<PublishStatus>,
    abandoned: Option<bool>,
    swept: Option<bool>,
}

impl StatusPredicate {
    /// Matches every record.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn transcript(mut self, status: TranscriptStatus) -> Self {
        self.transcript.push(status);
        self
    }

    pub fn analysis(mut self, status: AnalysisStatus) -> Self {
        self.analysis.push(status);
        self
    }

    pub fn publish(mut self, status: PublishStatus) -> Self {
        self.publish.push(status);
        self
    }

    pub fn abandoned(mut self, abandoned: bool) -> Self {
        self.abandoned = Some(abandoned);
        self
    }

    pub fn swept(mut self, swept: bool) -> Self {
        self.swept = Some(swept);
        self
    }

    pub fn matches(&self, record: &VideoRecord) -> bool {
        if !self.transcript.is_empty() && !self.transcript.contains(&record.transcript_status) {
            return false;
        }
        if !self.analysis.is_empty() && !self.analysis.contains(&record.analysis_status) {
            return false;
        }
        if !self.publish.is_empty() && !self.publish.contains(&record.publish_status) {
            return false;
        }
        if let Some(abandoned) = self.abandoned {
            if record.is_abandoned() != abandoned {
                return false;
            }
        }
        if let Some(swept) = self.swept {
            if record.is_swept() != swept {
                return false;
            }
        }
        true
    }
}
