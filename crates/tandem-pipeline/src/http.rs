//! HTTP adapters for the transcript provider, the analysis and summary
//! services and the artifact store.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use tandem_core::types::{VideoId, VideoRecord};

use crate::services::{
    AnalysisOutput, AnalysisRequest, AnalysisService, ArtifactStore, DigestRequest, ServiceError,
    SummaryOutput, SummaryService, TranscriptError, TranscriptSource,
};

const VIDEO_ID_PLACEHOLDER: &str = "{video_id}";

fn client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

fn with_bearer(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

// =============================================================================
// Transcript provider
// =============================================================================

/// Fetches transcripts from `endpoint`, where `{video_id}` is replaced by
/// the id of the requested video.
pub struct HttpTranscriptSource {
    client: reqwest::Client,
    url_template: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TranscriptBody {
    Text { text: String },
    Snippets(Vec<Snippet>),
    Wrapped { transcript: Vec<Snippet> },
}

#[derive(Deserialize)]
struct Snippet {
    text: String,
}

impl HttpTranscriptSource {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            client: client(timeout)?,
            url_template: url_template.into(),
        })
    }

    fn url_for(&self, id: &VideoId) -> String {
        self.url_template.replace(VIDEO_ID_PLACEHOLDER, id.as_str())
    }
}

/// How a provider answer maps onto the fetch outcome.
fn classify_status(status: StatusCode, body: &str) -> TranscriptError {
    let detail = format!("HTTP {}: {}", status.as_u16(), body.trim());
    match status {
        StatusCode::FORBIDDEN
        | StatusCode::TOO_MANY_REQUESTS
        | StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => TranscriptError::EnvironmentBlocked(detail),
        StatusCode::NOT_FOUND | StatusCode::GONE => TranscriptError::Unavailable(detail),
        _ => TranscriptError::Failed(detail),
    }
}

/// Accepts `{"text": ...}`, `[{"text": ...}, ...]`,
/// `{"transcript": [{"text": ...}]}` or plain text.
fn transcript_text(body: &str) -> String {
    let join = |snippets: Vec<Snippet>| {
        snippets
            .into_iter()
            .map(|s| s.text.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    };
    match serde_json::from_str::<TranscriptBody>(body) {
        Ok(TranscriptBody::Text { text }) => text,
        Ok(TranscriptBody::Snippets(snippets)) => join(snippets),
        Ok(TranscriptBody::Wrapped { transcript }) => join(transcript),
        Err(_) => body.to_string(),
    }
}

#[async_trait]
impl TranscriptSource for HttpTranscriptSource {
    async fn fetch(&self, record: &VideoRecord) -> Result<String, TranscriptError> {
        let url = self.url_for(&record.id);
        debug!(video_id = %record.id, %url, "Requesting transcript");
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_connect() {
                TranscriptError::EnvironmentBlocked(format!("cannot reach provider: {}", e))
            } else if e.is_timeout() {
                TranscriptError::Failed(format!("timed out: {}", e))
            } else {
                TranscriptError::Failed(e.to_string())
            }
        })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TranscriptError::Failed(format!("reading body: {}", e)))?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }
        Ok(transcript_text(&body))
    }
}

// =============================================================================
// Analysis service
// =============================================================================

pub struct HttpAnalysisService {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct AnalysisEnvelope {
    #[serde(default)]
    model: Option<String>,
    #[serde(alias = "analysis", alias = "result")]
    output: serde_json::Value,
}

impl HttpAnalysisService {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: client(timeout)?,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

/// Strip a surrounding Markdown code fence, if any.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Turn a service response into a structured payload.
///
/// The service either answers with an envelope `{"output": ..., "model": ...}`
/// or with the payload itself. String outputs are parsed as JSON after any
/// code fence is removed.
pub fn parse_analysis_payload(raw: &str) -> Result<AnalysisOutput, ServiceError> {
    let value: serde_json::Value = serde_json::from_str(strip_fences(raw))
        .map_err(|e| ServiceError::InvalidResponse(format!("analysis is not JSON: {}", e)))?;

    let (payload, model) = match serde_json::from_value::<AnalysisEnvelope>(value.clone()) {
        Ok(envelope) => (envelope.output, envelope.model),
        Err(_) => (value, None),
    };
    let payload = match payload {
        serde_json::Value::String(text) => serde_json::from_str(strip_fences(&text))
            .map_err(|e| ServiceError::InvalidResponse(format!("analysis output: {}", e)))?,
        other => other,
    };
    if !payload.is_object() {
        return Err(ServiceError::InvalidResponse(
            "analysis payload must be a JSON object".to_string(),
        ));
    }
    Ok(AnalysisOutput {
        payload,
        raw: raw.to_string(),
        model,
    })
}

#[async_trait]
impl AnalysisService for HttpAnalysisService {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisOutput, ServiceError> {
        debug!(video_id = %request.video_id, chars = request.transcript.len(), "Requesting analysis");
        let response = with_bearer(self.client.post(&self.endpoint), self.api_key.as_deref())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_analysis_payload(&body)
    }
}

// =============================================================================
// Summary service
// =============================================================================

pub struct HttpSummaryService {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct SummaryEnvelope {
    #[serde(default)]
    model: Option<String>,
    #[serde(alias = "output", alias = "text")]
    summary: String,
}

impl HttpSummaryService {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: client(timeout)?,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

/// Accepts `{"summary": ..., "model": ...}` (also keyed `output` or `text`),
/// a JSON string or plain Markdown.
pub fn parse_summary_text(raw: &str) -> Result<SummaryOutput, ServiceError> {
    let (text, model) = match serde_json::from_str::<SummaryEnvelope>(raw) {
        Ok(envelope) => (envelope.summary, envelope.model),
        Err(_) => match serde_json::from_str::<String>(raw) {
            Ok(text) => (text, None),
            Err(_) => (raw.to_string(), None),
        },
    };
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ServiceError::InvalidResponse("summary is empty".to_string()));
    }
    Ok(SummaryOutput { text, model })
}

#[async_trait]
impl SummaryService for HttpSummaryService {
    async fn summarize(&self, request: &DigestRequest) -> Result<SummaryOutput, ServiceError> {
        debug!(period = %request.period, entries = request.entries.len(), "Requesting summary");
        let response = with_bearer(self.client.post(&self.endpoint), self.api_key.as_deref())
            .json(request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body,
            });
        }
        parse_summary_text(&body)
    }
}

// =============================================================================
// Artifact store
// =============================================================================

/// PUTs objects to `<base_url>/<key>`.
pub struct HttpArtifactStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpArtifactStore {
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        Ok(Self {
            client: client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn put(
        &self,
        key: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> Result<String, ServiceError> {
        let url = format!("{}/{}", self.base_url, key.trim_start_matches('/'));
        let response = with_bearer(self.client.put(&url), self.token.as_deref())
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        debug!(%url, "Object uploaded");
        Ok(url)
    }
}
