//! Feed source contracts, the page-post parser, and source implementations.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedsync_core::{FeedItem, ParsedRecord};
use feedsync_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "feedsync-adapters";

/// First lines longer than this (in chars) are candidates for shortening.
pub const HEADLINE_SPLIT_THRESHOLD: usize = 100;

/// Minimum chars before the first period for a shortened headline.
pub const MIN_HEADLINE_PREFIX: usize = 20;

/// Marker that precedes ad/footer text in page posts.
pub const FOOTER_SEPARATOR: &str = "----------------------------------------------";

/// Upper bound on a single page request.
pub const MAX_FETCH_LIMIT: usize = 100;

const GRAPH_POST_FIELDS: &str = "id,message,full_picture,created_time,permalink_url";

/// Turn a feed item into record fields, or `None` when it has no usable text
/// or no readable timestamp.
pub fn parse_feed_item(item: &FeedItem) -> Option<ParsedRecord> {
    let published_at = item.created_at?;
    let message = item.message.as_deref()?;
    let mut lines = message.lines().map(str::trim).filter(|line| !line.is_empty());
    let first_line = lines.next()?;

    let headline = extract_headline(first_line);
    let body = strip_footer(&lines.collect::<Vec<_>>().join("\n"));

    Some(ParsedRecord {
        external_id: item.external_id.clone(),
        headline,
        body,
        image_url: item.image_url.clone(),
        published_at,
        source_link: item.permalink.clone(),
    })
}

/// Overlong first lines are cut after their first period, unless the text
/// before that period is too short to stand alone (abbreviations etc.).
pub fn extract_headline(first_line: &str) -> String {
    if first_line.chars().count() > HEADLINE_SPLIT_THRESHOLD {
        if let Some(idx) = first_line.find('.') {
            if first_line[..idx].chars().count() >= MIN_HEADLINE_PREFIX {
                return first_line[..=idx].to_string();
            }
        }
    }
    first_line.to_string()
}

pub fn strip_footer(body: &str) -> String {
    let kept = match body.find(FOOTER_SEPARATOR) {
        Some(idx) => &body[..idx],
        None => body,
    };
    kept.trim().to_string()
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed source misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding feed response: {0}")]
    Decode(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Upstream feed contract. Items come back in the source's recency order,
/// newest first.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<FeedItem>, FeedError>;
}

/// Envelope shared by the Graph API posts edge and fixture files. Posts stay
/// raw so one malformed entry cannot fail the whole page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphPostsPage {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphPost {
    pub id: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub full_picture: Option<String>,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub permalink_url: Option<String>,
}

impl GraphPost {
    /// An unreadable `created_time` leaves `created_at` empty; the parser
    /// then skips the item.
    pub fn into_feed_item(self) -> FeedItem {
        let created_at = self.created_time.as_deref().and_then(parse_graph_timestamp);
        if created_at.is_none() {
            tracing::warn!(post_id = %self.id, created_time = ?self.created_time, "post has no readable created_time");
        }
        FeedItem {
            external_id: self.id,
            message: self.message,
            image_url: self.full_picture,
            created_at,
            permalink: self.permalink_url,
        }
    }
}

/// Accepts RFC 3339 and the Graph API's `+0000` offset form.
pub fn parse_graph_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Posts that do not decode at all are dropped with a warning; they carry no
/// usable identifier to count against.
fn page_to_items(source_id: &str, page: GraphPostsPage, limit: usize) -> Vec<FeedItem> {
    page.data
        .into_iter()
        .take(limit)
        .filter_map(|raw| match serde_json::from_value::<GraphPost>(raw) {
            Ok(post) => Some(post.into_feed_item()),
            Err(err) => {
                tracing::warn!(source_id, error = %err, "dropping undecodable post");
                None
            }
        })
        .collect()
}

fn clamp_limit(limit: usize) -> usize {
    limit.clamp(1, MAX_FETCH_LIMIT)
}

#[derive(Debug, Clone)]
pub struct GraphSourceConfig {
    pub base_url: String,
    pub api_version: String,
    pub page_id: String,
    pub access_token: String,
}

/// Most recent posts of one page via the Graph API posts edge.
#[derive(Debug, Clone)]
pub struct GraphFeedSource {
    http: HttpFetcher,
    config: GraphSourceConfig,
}

impl GraphFeedSource {
    pub fn new(http: HttpFetcher, config: GraphSourceConfig) -> Self {
        Self { http, config }
    }

    pub fn posts_url(&self) -> String {
        format!(
            "{}/{}/{}/posts",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version,
            self.config.page_id
        )
    }
}

#[async_trait]
impl FeedSource for GraphFeedSource {
    fn source_id(&self) -> &str {
        &self.config.page_id
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<FeedItem>, FeedError> {
        if self.config.page_id.is_empty() || self.config.access_token.is_empty() {
            return Err(FeedError::Config(
                "page id and access token are required".to_string(),
            ));
        }

        let limit = clamp_limit(limit);
        let query = [
            ("fields", GRAPH_POST_FIELDS.to_string()),
            ("limit", limit.to_string()),
            ("access_token", self.config.access_token.clone()),
        ];
        let resp = self.http.fetch_bytes(&self.posts_url(), &query).await?;
        let page: GraphPostsPage = serde_json::from_slice(&resp.body)
            .map_err(|e| FeedError::Decode(e.to_string()))?;

        let items = page_to_items(&self.config.page_id, page, limit);
        tracing::debug!(page_id = %self.config.page_id, items = items.len(), "fetched page posts");
        Ok(items)
    }
}

/// Serves posts from a JSON file in the Graph envelope shape.
#[derive(Debug, Clone)]
pub struct FixtureFeedSource {
    source_id: String,
    path: PathBuf,
}

impl FixtureFeedSource {
    pub fn new(source_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FeedSource for FixtureFeedSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<FeedItem>, FeedError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let page: GraphPostsPage = serde_json::from_str(&text)
            .map_err(|e| FeedError::Decode(format!("{}: {e}", self.path.display())))?;
        Ok(page_to_items(&self.source_id, page, clamp_limit(limit)))
    }
}
