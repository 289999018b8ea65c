use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifiers
// =============================================================================

/// Identifier of a video within a catalog.
///
/// Identifiers double as file names in the versioned store, so only ASCII
/// alphanumerics, `-` and `_` are accepted.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VideoId(String);

impl VideoId {
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.is_empty() {
            return Err("video id must not be empty".to_string());
        }
        if raw.len() > 128 {
            return Err(format!("video id too long ({} bytes)", raw.len()));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(format!("invalid character {:?} in video id {:?}", bad, raw));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for VideoId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VideoId {
    type Error = String;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VideoId> for String {
    fn from(id: VideoId) -> Self {
        id.0
    }
}

// =============================================================================
// Status enums (three independent CAS domains)
// =============================================================================

/// Transcript acquisition state of a video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptStatus {
    #[default]
    Missing,
    Fetched,
    FetchFailed,
}

impl fmt::Display for TranscriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptStatus::Missing => write!(f, "missing"),
            TranscriptStatus::Fetched => write!(f, "fetched"),
            TranscriptStatus::FetchFailed => write!(f, "fetch_failed"),
        }
    }
}

impl std::str::FromStr for TranscriptStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "missing" => Ok(TranscriptStatus::Missing),
            "fetched" => Ok(TranscriptStatus::Fetched),
            "fetch_failed" => Ok(TranscriptStatus::FetchFailed),
            _ => Err(format!("Unknown transcript status: {}", s)),
        }
    }
}

/// Analysis state of a video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Pending,
    Analyzed,
    AnalysisFailed,
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisStatus::Pending => write!(f, "pending"),
            AnalysisStatus::Analyzed => write!(f, "analyzed"),
            AnalysisStatus::AnalysisFailed => write!(f, "analysis_failed"),
        }
    }
}

impl std::str::FromStr for AnalysisStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AnalysisStatus::Pending),
            "analyzed" => Ok(AnalysisStatus::Analyzed),
            "analysis_failed" => Ok(AnalysisStatus::AnalysisFailed),
            _ => Err(format!("Unknown analysis status: {}", s)),
        }
    }
}

/// Artifact publication state of a video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    #[default]
    Unpublished,
    Published,
}

impl fmt::Display for PublishStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishStatus::Unpublished => write!(f, "unpublished"),
            PublishStatus::Published => write!(f, "published"),
        }
    }
}

impl std::str::FromStr for PublishStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unpublished" => Ok(PublishStatus::Unpublished),
            "published" => Ok(PublishStatus::Published),
            _ => Err(format!("Unknown publish status: {}", s)),
        }
    }
}

/// Pipeline stage owning one of the status fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Transcript,
    Analysis,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Transcript => write!(f, "transcript"),
            Stage::Analysis => write!(f, "analysis"),
            Stage::Publish => write!(f, "publish"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transcript" | "fetch" => Ok(Stage::Transcript),
            "analysis" | "analyze" => Ok(Stage::Analysis),
            "publish" => Ok(Stage::Publish),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

// =============================================================================
// Domain structs
// =============================================================================

/// Metadata taken from the catalog feed when a video is discovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMeta {
    pub channel_id: String,
    pub channel_name: String,
    pub title: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: Option<String>,
}

/// One known video and its per-stage pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: VideoId,
    pub source: SourceMeta,
    pub discovered_at: DateTime<Utc>,

    #[serde(default)]
    pub transcript_status: TranscriptStatus,
    #[serde(default)]
    pub analysis_status: AnalysisStatus,
    #[serde(default)]
    pub publish_status: PublishStatus,

    #[serde(default)]
    pub fetch_attempts: u32,
    #[serde(default)]
    pub analysis_attempts: u32,
    #[serde(default)]
    pub publish_attempts: u32,

    /// Most recent per-video failure, kept for diagnostics.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set once a stage exhausted its retry budget.
    #[serde(default)]
    pub abandoned_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub transcript_fetched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub analyzed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifact_uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifact_location: Option<String>,
    /// Set by the retention sweeper once local working data was deleted.
    #[serde(default)]
    pub swept_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    /// A freshly discovered record in the initial state of every stage.
    pub fn discovered(id: VideoId, source: SourceMeta, at: DateTime<Utc>) -> Self {
        Self {
            id,
            source,
            discovered_at: at,
            transcript_status: TranscriptStatus::Missing,
            analysis_status: AnalysisStatus::Pending,
            publish_status: PublishStatus::Unpublished,
            fetch_attempts: 0,
            analysis_attempts: 0,
            publish_attempts: 0,
            last_error: None,
            abandoned_at: None,
            transcript_fetched_at: None,
            analyzed_at: None,
            artifact_uploaded_at: None,
            artifact_location: None,
            swept_at: None,
        }
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned_at.is_some()
    }

    pub fn is_swept(&self) -> bool {
        self.swept_at.is_some()
    }

    pub fn attempts(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Transcript => self.fetch_attempts,
            Stage::Analysis => self.analysis_attempts,
            Stage::Publish => self.publish_attempts,
        }
    }
}

/// Raw transcript text owned by a single video record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptBlob {
    pub text: String,
    pub fetched_at: DateTime<Utc>,
}

impl TranscriptBlob {
    pub fn new(text: impl Into<String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            fetched_at,
        }
    }

    pub fn len_bytes(&self) -> usize {
        self.text.len()
    }
}

/// Structured output of one analysis of one video. Never mutated once
/// created; re-analysis appends a new result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: Uuid,
    pub video_id: VideoId,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub model: Option<String>,
    pub payload: serde_json::Value,
}

impl AnalysisResult {
    pub fn new(
        video_id: VideoId,
        payload: serde_json::Value,
        model: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            video_id,
            created_at,
            model,
            payload,
        }
    }
}

// =============================================================================
// Digests
// =============================================================================

/// Check that a digest period label is usable as a file name.
pub fn validate_period(period: &str) -> Result<(), String> {
    if period.is_empty() || period.len() > 64 {
        return Err(format!("invalid digest period {:?}", period));
    }
    match period
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        Some(bad) => Err(format!("invalid character {:?} in digest period {:?}", bad, period)),
        None => Ok(()),
    }
}

/// One analysis result a digest was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSource {
    pub video_id: VideoId,
    pub result_id: Uuid,
}

/// Summary across the analyses of one schedule period.
///
/// Digests are immutable. Running again after new analyses arrived in the
/// same period appends a new digest for that period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    pub id: Uuid,
    /// File-safe period key, e.g. `2025-03-10` or `2025-w10`.
    pub period: String,
    /// Human-readable window description, e.g. "last 7 days".
    pub label: String,
    pub since: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub model: Option<String>,
    pub summary: String,
    pub sources: Vec<DigestSource>,
    #[serde(default)]
    pub channels: Vec<String>,
    /// Where the uploaded JSON copy lives.
    #[serde(default)]
    pub location: Option<String>,
}

impl Digest {
    /// Whether this digest was built from exactly `results`.
    pub fn covers(&self, results: &[DigestSource]) -> bool {
        let mut mine: Vec<&Uuid> = self.sources.iter().map(|s| &s.result_id).collect();
        let mut theirs: Vec<&Uuid> = results.iter().map(|s| &s.result_id).collect();
        mine.sort();
        theirs.sort();
        mine == theirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceMeta {
        SourceMeta {
            channel_id: "UC123".to_string(),
            channel_name: "Draft Talk".to_string(),
            title: "Gameweek preview".to_string(),
            published_at: None,
            url: None,
        }
    }

    // =====================================================================
    // VideoId
    // =====================================================================

    #[test]
    fn test_video_id_accepts_youtube_style_ids() {
        let id = VideoId::parse("dQw4w9WgXcQ").unwrap();
        assert_eq!(id.as_str(), "dQw4w9WgXcQ");
        assert!(VideoId::parse("a-b_c").is_ok());
    }

    #[test]
    fn test_video_id_rejects_path_characters() {
        assert!(VideoId::parse("").is_err());
        assert!(VideoId::parse("../etc").is_err());
        assert!(VideoId::parse("a/b").is_err());
        assert!(VideoId::parse("with space").is_err());
        assert!(VideoId::parse(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_video_id_serde_validates() {
        let ok: VideoId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(ok.to_string(), "abc");
        let bad: Result<VideoId, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_digest_period_names() {
        assert!(validate_period("2025-03-10").is_ok());
        assert!(validate_period("2025-w10").is_ok());
        assert!(validate_period("").is_err());
        assert!(validate_period("last 7 days").is_err());
        assert!(validate_period("../x").is_err());
    }

    #[test]
    fn test_digest_covers_ignores_order() {
        let a = DigestSource {
            video_id: VideoId::parse("a").unwrap(),
            result_id: Uuid::new_v4(),
        };
        let b = DigestSource {
            video_id: VideoId::parse("b").unwrap(),
            result_id: Uuid::new_v4(),
        };
        let digest = Digest {
            id: Uuid::new_v4(),
            period: "2025-03-10".to_string(),
            label: "last 7 days".to_string(),
            since: Utc::now(),
            created_at: Utc::now(),
            model: None,
            summary: "s".to_string(),
            sources: vec![a.clone(), b.clone()],
            channels: vec![],
            location: None,
        };
        assert!(digest.covers(&[b.clone(), a.clone()]));
        assert!(!digest.covers(&[a]));
    }

    // =====================================================================
    // Status enums
    // =====================================================================

    #[test]
    fn test_status_display_matches_serde() {
        for status in [
            TranscriptStatus::Missing,
            TranscriptStatus::Fetched,
            TranscriptStatus::FetchFailed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
            assert_eq!(status.to_string().parse::<TranscriptStatus>().unwrap(), status);
        }
        for status in [
            AnalysisStatus::Pending,
            AnalysisStatus::Analyzed,
            AnalysisStatus::AnalysisFailed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
            assert_eq!(status.to_string().parse::<AnalysisStatus>().unwrap(), status);
        }
        for status in [PublishStatus::Unpublished, PublishStatus::Published] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
            assert_eq!(status.to_string().parse::<PublishStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_stage_parse_aliases() {
        assert_eq!("fetch".parse::<Stage>().unwrap(), Stage::Transcript);
        assert_eq!("analyze".parse::<Stage>().unwrap(), Stage::Analysis);
        assert_eq!("publish".parse::<Stage>().unwrap(), Stage::Publish);
        assert!("sweep".parse::<Stage>().is_err());
    }

    // =====================================================================
    // VideoRecord
    // =====================================================================

    #[test]
    fn test_discovered_record_initial_state() {
        let record = VideoRecord::discovered(VideoId::parse("v1").unwrap(), source(), Utc::now());
        assert_eq!(record.transcript_status, TranscriptStatus::Missing);
        assert_eq!(record.analysis_status, AnalysisStatus::Pending);
        assert_eq!(record.publish_status, PublishStatus::Unpublished);
        assert_eq!(record.attempts(Stage::Transcript), 0);
        assert!(!record.is_abandoned());
        assert!(!record.is_swept());
    }

    #[test]
    fn test_record_deserializes_with_missing_optional_fields() {
        let json = r#"{
            "id": "v1",
            "source": {"channel_id": "c", "channel_name": "C", "title": "t"},
            "discovered_at": "2025-01-01T00:00:00Z"
        }"#;
        let record: VideoRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.transcript_status, TranscriptStatus::Missing);
        assert_eq!(record.publish_attempts, 0);
        assert!(record.source.url.is_none());
    }
}
