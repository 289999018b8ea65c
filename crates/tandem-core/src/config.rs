use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TandemError};

/// YouTube channel feed used when a channel entry carries no explicit URL.
pub const DEFAULT_FEED_TEMPLATE: &str =
    "https://www.youtube.com/feeds/videos.xml?channel_id={channel_id}";

/// Top-level configuration for both pipeline environments.
///
/// Loaded from `~/.tandem/config.toml` by default. Secrets are never stored
/// here; sections name the environment variables that hold them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TandemConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl TandemConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TandemConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would make a run loop forever or never start.
    pub fn validate(&self) -> Result<()> {
        if self.sync.max_attempts == 0 {
            return Err(TandemError::Config(
                "sync.max_attempts must be at least 1".to_string(),
            ));
        }
        for (name, budget) in [
            ("retry.fetch_attempts", self.retry.fetch_attempts),
            ("retry.analysis_attempts", self.retry.analysis_attempts),
            ("retry.publish_attempts", self.retry.publish_attempts),
        ] {
            if budget == 0 {
                return Err(TandemError::Config(format!("{} must be at least 1", name)));
            }
        }
        for (name, concurrency) in [
            ("fetch.concurrency", self.fetch.concurrency),
            ("analysis.concurrency", self.analysis.concurrency),
            ("publish.concurrency", self.publish.concurrency),
        ] {
            if concurrency == 0 {
                return Err(TandemError::Config(format!("{} must be at least 1", name)));
            }
        }
        if self.digest.schedule == ScheduleKind::RollingDays && self.digest.days == 0 {
            return Err(TandemError::Config(
                "digest.days must be at least 1".to_string(),
            ));
        }
        self.digest.start_weekday()?;
        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id.as_str()) {
                return Err(TandemError::Config(format!(
                    "duplicate channel id: {}",
                    channel.id
                )));
            }
        }
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Which versioned store holds the shared pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Revisioned directory on a shared filesystem.
    Dir,
    /// Clone of a remote git repository.
    Git,
}

/// Versioned store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Store root (dir backend) or local clone path (git backend).
    pub path: String,
    /// Remote URL to clone when the git clone does not exist yet.
    pub remote_url: Option<String>,
    pub remote: String,
    pub branch: String,
    /// Directory inside the repository that holds the pipeline layout.
    pub subdir: String,
    /// Environment variable holding the repository access token.
    pub token_env: Option<String>,
    pub author_name: String,
    pub author_email: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Dir,
            path: "~/.tandem/store".to_string(),
            remote_url: None,
            remote: "origin".to_string(),
            branch: "main".to_string(),
            subdir: "pipeline".to_string(),
            token_env: Some("TANDEM_STORE_TOKEN".to_string()),
            author_name: "tandem".to_string(),
            author_email: "tandem@localhost".to_string(),
        }
    }
}

/// Pull-merge-commit retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Full pull/replay/commit cycles before giving up with a conflict.
    pub max_attempts: u32,
    /// Linear backoff unit between cycles, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 250,
        }
    }
}

impl SyncConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Per-stage attempt budgets across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub fetch_attempts: u32,
    pub analysis_attempts: u32,
    pub publish_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            fetch_attempts: 3,
            analysis_attempts: 3,
            publish_attempts: 3,
        }
    }
}

/// Transcript source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// URL template; `{video_id}` is replaced per request.
    pub endpoint: String,
    pub concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8700/transcripts/{video_id}".to_string(),
            concurrency: 4,
            timeout_secs: 60,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Analysis service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub endpoint: String,
    /// Environment variable holding the service API key.
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub concurrency: usize,
    pub timeout_secs: u64,
    /// Transcripts longer than this are cut before being sent.
    pub max_transcript_chars: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8701/analyze".to_string(),
            api_key_env: Some("TANDEM_ANALYSIS_KEY".to_string()),
            model: None,
            concurrency: 2,
            timeout_secs: 300,
            max_transcript_chars: 100_000,
        }
    }
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Where published artifacts go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactBackend {
    Dir,
    Http,
}

/// Artifact publication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishConfig {
    pub backend: ArtifactBackend,
    /// Directory path (dir backend) or base URL (http backend).
    pub target: String,
    /// Environment variable holding the upload bearer token.
    pub token_env: Option<String>,
    pub concurrency: usize,
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            backend: ArtifactBackend::Dir,
            target: "~/.tandem/artifacts".to_string(),
            token_env: None,
            concurrency: 4,
            timeout_secs: 60,
        }
    }
}

impl PublishConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Retention sweeper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Also sweep records abandoned after exhausting a retry budget.
    pub sweep_abandoned: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sweep_abandoned: true,
        }
    }
}

/// Catalog discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub enabled: bool,
    /// Skip feed entries published more than this many days ago; 0 keeps all.
    pub since_days: u32,
    pub timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            since_days: 14,
            timeout_secs: 30,
        }
    }
}

impl FeedConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How the digest window is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// The last `days` days, ending now.
    RollingDays,
    /// Since midnight of the most recent `start_day`.
    Weekly,
    /// Since midnight UTC today.
    Daily,
}

/// Periodic digest configuration.
///
/// The digest service shares the analysis API key and model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub schedule: ScheduleKind,
    /// Window length for `rolling_days`.
    pub days: u32,
    /// First day of the week for `weekly`, e.g. "monday".
    pub start_day: String,
    pub timeout_secs: u64,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://127.0.0.1:8701/summarize".to_string(),
            schedule: ScheduleKind::RollingDays,
            days: 7,
            start_day: "monday".to_string(),
            timeout_secs: 300,
        }
    }
}

impl DigestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn start_weekday(&self) -> Result<chrono::Weekday> {
        self.start_day.parse().map_err(|_| {
            TandemError::Config(format!("digest.start_day {:?} is not a weekday", self.start_day))
        })
    }
}

/// A channel whose feed is polled for new videos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub feed_url: Option<String>,
}

impl ChannelConfig {
    pub fn feed_url(&self) -> String {
        match &self.feed_url {
            Some(url) => url.clone(),
            None => DEFAULT_FEED_TEMPLATE.replace("{channel_id}", &self.id),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn resolve_path(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        #[cfg(target_os = "windows")]
        let home = std::env::var("USERPROFILE").unwrap_or_else(|_| ".".to_string());
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(raw)
    }
}
