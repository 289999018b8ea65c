//! Scripted service implementations.
//!
//! Used by tests and by `--mock` runs to drive the stages without any
//! network access. Each mock answers deterministically per video id and
//! records what it was asked, so tests can assert on the calls.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tandem_core::types::VideoRecord;

use crate::services::{
    AnalysisOutput, AnalysisRequest, AnalysisService, Artifact, ArtifactStore, CatalogFeed,
    DigestRequest, FeedEntry, ServiceError, SummaryOutput, SummaryService, TranscriptError,
    TranscriptSource,
};

type ErrorFactory = Arc<dyn Fn() -> TranscriptError + Send + Sync>;

// =============================================================================
// Transcript source
// =============================================================================

/// Returns `"transcript of <id>"` unless scripted otherwise.
#[derive(Default)]
pub struct MockTranscriptSource {
    texts: HashMap<String, String>,
    errors: HashMap<String, ErrorFactory>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockTranscriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, id: &str, text: impl Into<String>) -> Self {
        self.texts.insert(id.to_string(), text.into());
        self
    }

    pub fn with_error(
        mut self,
        id: &str,
        error: impl Fn() -> TranscriptError + Send + Sync + 'static,
    ) -> Self {
        self.errors.insert(id.to_string(), Arc::new(error));
        self
    }

    /// Sleep this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptSource for MockTranscriptSource {
    async fn fetch(&self, record: &VideoRecord) -> Result<String, TranscriptError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let id = record.id.as_str();
        if let Some(error) = self.errors.get(id) {
            return Err(error());
        }
        tracing::debug!(video_id = id, "Mock transcript served");
        Ok(self
            .texts
            .get(id)
            .cloned()
            .unwrap_or_else(|| format!("transcript of {}", id)))
    }
}

// =============================================================================
// Analysis service
// =============================================================================

/// Echoes the request back as a small JSON payload.
#[derive(Default)]
pub struct MockAnalysisService {
    failing: HashSet<String>,
    requests: Mutex<Vec<AnalysisRequest>>,
}

impl MockAnalysisService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }

    pub fn requests(&self) -> Vec<AnalysisRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AnalysisService for MockAnalysisService {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutput, ServiceError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.failing.contains(request.video_id.as_str()) {
            return Err(ServiceError::Status {
                status: 500,
                body: "mock analysis failure".to_string(),
            });
        }
        let payload = serde_json::json!({
            "video_id": request.video_id.as_str(),
            "title": request.title,
            "words": request.transcript.split_whitespace().count(),
        });
        Ok(AnalysisOutput {
            raw: payload.to_string(),
            payload,
            model: None,
        })
    }
}

// =============================================================================
// Summary service
// =============================================================================

/// Answers with a Markdown list of the titles it was given.
#[derive(Default)]
pub struct MockSummaryService {
    failing: bool,
    requests: Mutex<Vec<DigestRequest>>,
}

impl MockSummaryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service whose every call fails.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<DigestRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SummaryService for MockSummaryService {
    async fn summarize(&self, request: &DigestRequest) -> Result<SummaryOutput, ServiceError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if self.failing {
            return Err(ServiceError::Status {
                status: 529,
                body: "mock summary failure".to_string(),
            });
        }
        let mut text = format!("## {}\n", request.label);
        for entry in &request.entries {
            text.push_str(&format!("\n- {} ({})", entry.title, entry.channel_name));
        }
        Ok(SummaryOutput {
            text,
            model: request.model.clone(),
        })
    }
}

// =============================================================================
// Artifact store
// =============================================================================

/// One object held by [`MockArtifactStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub key: String,
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Keeps uploaded objects in memory; locations are `mock://<key>`.
#[derive(Default)]
pub struct MockArtifactStore {
    failing: HashSet<String>,
    puts: Mutex<Vec<StoredObject>>,
}

impl MockArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every key with `segment` as one of its path segments.
    pub fn failing(mut self, segment: &str) -> Self {
        self.failing.insert(segment.to_string());
        self
    }

    pub fn puts(&self) -> Vec<StoredObject> {
        self.puts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Every video artifact uploaded so far, in upload order.
    pub fn artifacts(&self) -> Vec<Artifact> {
        self.puts()
            .iter()
            .filter(|o| o.key.starts_with("videos/"))
            .filter_map(|o| serde_json::from_slice(&o.body).ok())
            .collect()
    }

    /// Keys under `prefix`, in upload order.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.puts()
            .into_iter()
            .map(|o| o.key)
            .filter(|k| k.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl ArtifactStore for MockArtifactStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<String, ServiceError> {
        if key.split('/').any(|segment| self.failing.contains(segment)) {
            return Err(ServiceError::Transport("mock upload refused".to_string()));
        }
        if let Ok(mut puts) = self.puts.lock() {
            puts.push(StoredObject {
                key: key.to_string(),
                content_type: content_type.to_string(),
                body,
            });
        }
        Ok(format!("mock://{}", key))
    }
}

// =============================================================================
// Catalog feed
// =============================================================================

pub struct MockCatalogFeed {
    entries: Option<Vec<FeedEntry>>,
}

impl MockCatalogFeed {
    pub fn new(entries: Vec<FeedEntry>) -> Self {
        Self {
            entries: Some(entries),
        }
    }

    /// A feed whose every read fails.
    pub fn unavailable() -> Self {
        Self { entries: None }
    }
}

#[async_trait]
impl CatalogFeed for MockCatalogFeed {
    async fn entries(&self) -> Result<Vec<FeedEntry>, ServiceError> {
        self.entries
            .clone()
            .ok_or_else(|| ServiceError::Transport("mock feed unavailable".to_string()))
    }
}
