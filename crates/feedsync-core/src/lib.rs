//! Core domain model for the page feed sync engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedsync-core";

/// Item as returned by the upstream feed. Never mutated by the engine.
///
/// `created_at` is `None` when the upstream timestamp is missing or
/// unreadable; such items are not ingestible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedItem {
    pub external_id: String,
    pub message: Option<String>,
    pub image_url: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub permalink: Option<String>,
}

/// Structured fields derived from a feed item's text.
///
/// `headline` is never empty; items without usable text never produce one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedRecord {
    pub external_id: String,
    pub headline: String,
    pub body: String,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Feed,
    Manual,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Feed => "feed",
            Provenance::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "feed" => Some(Provenance::Feed),
            "manual" => Some(Provenance::Manual),
            _ => None,
        }
    }
}

/// Persisted record.
///
/// `external_id` is unique across all records when present and is the only
/// deduplication key. `modified` is set by editing flows once a human touches
/// the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: Uuid,
    pub external_id: Option<String>,
    pub headline: String,
    pub body: String,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub source_link: Option<String>,
    pub provenance: Provenance,
    pub modified: bool,
    pub visible: bool,
    pub created_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn from_parsed(parsed: &ParsedRecord, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            external_id: Some(parsed.external_id.clone()),
            headline: parsed.headline.clone(),
            body: parsed.body.clone(),
            image_url: parsed.image_url.clone(),
            published_at: parsed.published_at,
            source_link: parsed.source_link.clone(),
            provenance: Provenance::Feed,
            modified: false,
            visible: true,
            created_at,
        }
    }
}
