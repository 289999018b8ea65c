//! Channel feed reader backing [`Discovery`](crate::Discovery).

use std::sync::OnceLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};

use tandem_core::config::{ChannelConfig, FeedConfig};
use tandem_core::types::VideoId;

use crate::services::{CatalogFeed, FeedEntry, ServiceError};

const UNKNOWN_TITLE: &str = "Unknown Title";
const VIDEO_ID_PREFIX: &str = "yt:video:";

fn watch_param_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&]v=([A-Za-z0-9_-]+)").expect("Invalid watch url regex"))
}

/// Reads the Atom/RSS feed of every configured channel.
pub struct RssCatalogFeed {
    client: reqwest::Client,
    channels: Vec<ChannelConfig>,
    /// Entries older than this many days are ignored; 0 keeps everything.
    since_days: u32,
}

impl RssCatalogFeed {
    pub fn new(channels: Vec<ChannelConfig>, config: &FeedConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            client,
            channels,
            since_days: config.since_days,
        })
    }

    fn cutoff(&self) -> Option<DateTime<Utc>> {
        (self.since_days > 0)
            .then(|| Utc::now() - chrono::Duration::days(i64::from(self.since_days)))
    }

    async fn read_channel(&self, channel: &ChannelConfig) -> Result<Vec<FeedEntry>, ServiceError> {
        let url = channel.feed_url();
        debug!(channel = %channel.id, %url, "Reading channel feed");
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let body = response.bytes().await?;
        parse_feed(&channel.id, &channel.name, &body, self.cutoff())
    }
}

#[async_trait]
impl CatalogFeed for RssCatalogFeed {
    async fn entries(&self) -> Result<Vec<FeedEntry>, ServiceError> {
        let mut entries = Vec::new();
        let mut failures = 0;
        for channel in &self.channels {
            match self.read_channel(channel).await {
                Ok(found) => {
                    debug!(channel = %channel.id, count = found.len(), "Channel feed read");
                    entries.extend(found);
                }
                Err(e) => {
                    failures += 1;
                    warn!(channel = %channel.id, "Skipping channel feed: {}", e);
                }
            }
        }
        if failures > 0 && failures == self.channels.len() {
            return Err(ServiceError::Other(format!(
                "all {} channel feeds failed",
                failures
            )));
        }
        info!(
            channels = self.channels.len(),
            entries = entries.len(),
            "Catalog feed read"
        );
        Ok(entries)
    }
}

/// Parse one channel feed. Entries without a usable video id, or published
/// before `cutoff`, are dropped.
pub fn parse_feed(
    channel_id: &str,
    channel_name: &str,
    body: &[u8],
    cutoff: Option<DateTime<Utc>>,
) -> Result<Vec<FeedEntry>, ServiceError> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| ServiceError::InvalidResponse(format!("unparseable feed: {}", e)))?;
    let feed_title = feed.title.map(|t| t.content);

    let mut entries = Vec::with_capacity(feed.entries.len());
    for entry in feed.entries {
        let link = entry.links.first().map(|l| l.href.clone());
        let Some(video_id) = video_id_of(&entry.id, link.as_deref()) else {
            debug!(entry = %entry.id, "Feed entry without a video id");
            continue;
        };
        let published_at = entry.published.or(entry.updated);
        if let (Some(cutoff), Some(published)) = (cutoff, published_at) {
            if published < cutoff {
                continue;
            }
        }
        let channel_name = if channel_name.is_empty() {
            entry
                .authors
                .first()
                .map(|a| a.name.clone())
                .or_else(|| feed_title.clone())
                .unwrap_or_else(|| channel_id.to_string())
        } else {
            channel_name.to_string()
        };
        entries.push(FeedEntry {
            video_id,
            channel_id: channel_id.to_string(),
            channel_name,
            title: entry
                .title
                .map(|t| t.content.trim().to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
            published_at,
            url: link,
        });
    }
    Ok(entries)
}

fn video_id_of(entry_id: &str, link: Option<&str>) -> Option<VideoId> {
    if let Some(raw) = entry_id.strip_prefix(VIDEO_ID_PREFIX) {
        return VideoId::parse(raw).ok();
    }
    link.and_then(|l| watch_param_regex().captures(l))
        .and_then(|c| c.get(1))
        .and_then(|m| VideoId::parse(m.as_str()).ok())
}
