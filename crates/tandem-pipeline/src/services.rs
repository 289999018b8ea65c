//! External collaborators of the pipeline.
//!
//! Every provider is reached through one of these object-safe traits, so
//! stages can be driven by the HTTP adapters in production and by the
//! scripted implementations in [`crate::mock`] in tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tandem_core::types::{AnalysisResult, SourceMeta, VideoId, VideoRecord};
use tandem_core::TandemError;

/// Transcript provider failures, split by how the run must react.
#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    /// The provider refuses this network environment. Aborts the whole run.
    #[error("blocked by provider: {0}")]
    EnvironmentBlocked(String),
    /// The video has no transcript (captions disabled, removed, private).
    #[error("transcript unavailable: {0}")]
    Unavailable(String),
    #[error("transcript fetch failed: {0}")]
    Failed(String),
}

/// Failures of the analysis and summary services, the artifact store or the
/// catalog feed.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

impl From<ServiceError> for TandemError {
    fn from(err: ServiceError) -> Self {
        TandemError::External(err.to_string())
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            ServiceError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            ServiceError::Transport(err.to_string())
        }
    }
}

/// Input for one analysis call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisRequest {
    pub video_id: VideoId,
    pub title: String,
    pub channel_name: String,
    pub transcript: String,
    /// Whether `transcript` was cut to the configured maximum.
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// Parsed analysis plus the raw response it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisOutput {
    pub payload: serde_json::Value,
    pub raw: String,
    pub model: Option<String>,
}

/// The document uploaded for a published video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub video_id: VideoId,
    pub source: SourceMeta,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub transcript_fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
    pub result: AnalysisResult,
}

impl Artifact {
    pub fn build(record: &VideoRecord, result: &AnalysisResult) -> Self {
        Self {
            video_id: record.id.clone(),
            source: record.source.clone(),
            discovered_at: record.discovered_at,
            transcript_fetched_at: record.transcript_fetched_at,
            analyzed_at: record.analyzed_at,
            result: result.clone(),
        }
    }

    /// Object key. One key per analysis result, so two runs publishing
    /// different results of a video never write the same object.
    pub fn key(&self) -> String {
        format!("videos/{}/{}.json", self.video_id, self.result.id)
    }
}

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const MARKDOWN_CONTENT_TYPE: &str = "text/markdown; charset=utf-8";

/// Serialize `value` and store it under `key`.
pub async fn put_json<T: Serialize + Sync>(
    store: &dyn ArtifactStore,
    key: &str,
    value: &T,
) -> Result<String, ServiceError> {
    let body = serde_json::to_vec_pretty(value).map_err(|e| ServiceError::Other(e.to_string()))?;
    store.put(key, JSON_CONTENT_TYPE, body).await
}

/// One analyzed video as handed to the summary service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestEntry {
    pub video_id: VideoId,
    pub result_id: Uuid,
    pub title: String,
    pub channel_name: String,
    pub published_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

/// Input for one summary call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DigestRequest {
    pub period: String,
    pub label: String,
    pub since: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub entries: Vec<DigestEntry>,
}

impl DigestRequest {
    /// Distinct channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> =
            self.entries.iter().map(|e| e.channel_name.clone()).collect();
        channels.sort();
        channels.dedup();
        channels
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryOutput {
    pub text: String,
    pub model: Option<String>,
}

/// One video announced by a channel feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEntry {
    pub video_id: VideoId,
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

impl FeedEntry {
    pub fn source(&self) -> SourceMeta {
        SourceMeta {
            channel_id: self.channel_id.clone(),
            channel_name: self.channel_name.clone(),
            title: self.title.clone(),
            published_at: self.published_at,
            url: self.url.clone(),
        }
    }
}

#[async_trait]
pub trait TranscriptSource: Send + Sync {
    async fn fetch(&self, record: &VideoRecord) -> Result<String, TranscriptError>;
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutput, ServiceError>;
}

#[async_trait]
pub trait SummaryService: Send + Sync {
    async fn summarize(&self, request: &DigestRequest) -> Result<SummaryOutput, ServiceError>;
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `body` under `key` and return where it now lives.
    ///
    /// Keys are `/`-separated relative paths. Putting the same key again
    /// replaces the object.
    async fn put(&self, key: &str, content_type: &str, body: Vec<u8>)
        -> Result<String, ServiceError>;
}

#[async_trait]
pub trait CatalogFeed: Send + Sync {
    async fn entries(&self) -> Result<Vec<FeedEntry>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TranscriptError::EnvironmentBlocked("HTTP 429".to_string());
        assert_eq!(err.to_string(), "blocked by provider: HTTP 429");

        let err = ServiceError::Status {
            status: 503,
            body: "busy".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503: busy");

        let err = ServiceError::Timeout(Duration::from_secs(2));
        assert_eq!(err.to_string(), "request timed out after 2s");
    }

    #[test]
    fn test_service_error_is_external() {
        let err: TandemError = ServiceError::Transport("reset".to_string()).into();
        assert!(matches!(err, TandemError::External(_)));
    }

    #[test]
    fn test_artifact_layout() {
        let id = VideoId::parse("abc").unwrap();
        let record = VideoRecord::discovered(
            id.clone(),
            SourceMeta {
                channel_id: "c".to_string(),
                channel_name: "C".to_string(),
                title: "T".to_string(),
                published_at: None,
                url: None,
            },
            Utc::now(),
        );
        let result =
            AnalysisResult::new(id, serde_json::json!({"captain_picks": []}), None, Utc::now());
        let artifact = Artifact::build(&record, &result);
        assert_eq!(artifact.key(), format!("videos/abc/{}.json", result.id));

        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["video_id"], "abc");
        assert_eq!(json["source"]["title"], "T");
        assert!(json["result"]["payload"]["captain_picks"].is_array());
    }
}
