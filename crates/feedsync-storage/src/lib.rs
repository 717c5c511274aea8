//! Record store gateway + HTTP fetch utilities for the feed sync engine.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use feedsync_core::{ParsedRecord, Provenance, StoredRecord};
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("{0} out of range")]
    OutOfRange(&'static str),
}

/// Persistence contract the sync orchestrator depends on.
///
/// Writes from the sync engine are insert-only: nothing here updates or
/// deletes an existing record.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every external identifier currently stored, regardless of visibility
    /// or edit state.
    async fn list_known_external_ids(&self) -> Result<HashSet<String>, StoreError>;

    /// Insert a new feed record. Returns `Ok(false)` when a record with the
    /// same external identifier already exists, including one committed by a
    /// concurrent writer after the caller's snapshot was taken.
    async fn insert_if_absent(&self, record: &ParsedRecord) -> Result<bool, StoreError>;

    /// Epoch milliseconds of the last completed sync, `0` when never synced.
    async fn get_last_sync_time(&self) -> Result<i64, StoreError>;

    async fn set_last_sync_time(&self, ts_ms: i64) -> Result<(), StoreError>;

    /// Visible records, newest first.
    async fn list_visible(&self, limit: usize, offset: usize) -> Result<Vec<StoredRecord>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn list_known_external_ids(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT external_id FROM records WHERE external_id IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        let mut ids = HashSet::with_capacity(rows.len());
        for row in rows {
            ids.insert(row.try_get::<String, _>("external_id")?);
        }
        Ok(ids)
    }

    async fn insert_if_absent(&self, record: &ParsedRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO records
                (id, external_id, headline, body, image_url, published_at, source_link,
                 provenance, modified, visible, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE, TRUE, NOW())
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&record.external_id)
        .bind(&record.headline)
        .bind(&record.body)
        .bind(&record.image_url)
        .bind(record.published_at)
        .bind(&record.source_link)
        .bind(Provenance::Feed.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_last_sync_time(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT last_sync_ms FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("last_sync_ms")?),
            None => Ok(0),
        }
    }

    async fn set_last_sync_time(&self, ts_ms: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, last_sync_ms) VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE SET last_sync_ms = EXCLUDED.last_sync_ms
            "#,
        )
        .bind(ts_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_visible(&self, limit: usize, offset: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, headline, body, image_url, published_at, source_link,
                   provenance, modified, visible, created_at
              FROM records
             WHERE visible
             ORDER BY published_at DESC, created_at DESC
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(i64::try_from(limit).map_err(|_| StoreError::OutOfRange("limit"))?)
        .bind(i64::try_from(offset).map_err(|_| StoreError::OutOfRange("offset"))?)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(stored_record_from_row).collect()
    }
}

fn stored_record_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredRecord, StoreError> {
    let provenance: String = row.try_get("provenance")?;
    let provenance = Provenance::parse(&provenance)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown provenance {provenance:?}")))?;
    Ok(StoredRecord {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        headline: row.try_get("headline")?,
        body: row.try_get("body")?,
        image_url: row.try_get("image_url")?,
        published_at: row.try_get("published_at")?,
        source_link: row.try_get("source_link")?,
        provenance,
        modified: row.try_get("modified")?,
        visible: row.try_get("visible")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<StoredRecord>,
    by_external_id: HashMap<String, usize>,
    last_sync_ms: i64,
}

/// Process-local store with the same uniqueness and insert-only semantics as
/// the postgres store. Used for `FEEDSYNC_STORE=memory` and in tests.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    state: Mutex<MemoryState>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an existing record as-is, e.g. one authored manually. Returns
    /// `false` if its external identifier is already taken.
    pub async fn seed(&self, record: StoredRecord) -> bool {
        let mut state = self.state.lock().await;
        if let Some(external_id) = &record.external_id {
            if state.by_external_id.contains_key(external_id) {
                return false;
            }
            let idx = state.records.len();
            state.by_external_id.insert(external_id.clone(), idx);
        }
        state.records.push(record);
        true
    }

    /// Apply a hand edit to the record with `external_id`; marks it modified.
    pub async fn edit<F>(&self, external_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut StoredRecord),
    {
        let mut state = self.state.lock().await;
        let Some(&idx) = state.by_external_id.get(external_id) else {
            return false;
        };
        let record = &mut state.records[idx];
        apply(record);
        record.modified = true;
        true
    }

    pub async fn get_by_external_id(&self, external_id: &str) -> Option<StoredRecord> {
        let state = self.state.lock().await;
        state
            .by_external_id
            .get(external_id)
            .map(|&idx| state.records[idx].clone())
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn list_known_external_ids(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.state.lock().await.by_external_id.keys().cloned().collect())
    }

    async fn insert_if_absent(&self, record: &ParsedRecord) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.by_external_id.contains_key(&record.external_id) {
            return Ok(false);
        }
        let idx = state.records.len();
        state
            .records
            .push(StoredRecord::from_parsed(record, Utc::now()));
        state.by_external_id.insert(record.external_id.clone(), idx);
        Ok(true)
    }

    async fn get_last_sync_time(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.last_sync_ms)
    }

    async fn set_last_sync_time(&self, ts_ms: i64) -> Result<(), StoreError> {
        self.state.lock().await.last_sync_ms = ts_ms;
        Ok(())
    }

    async fn list_visible(&self, limit: usize, offset: usize) -> Result<Vec<StoredRecord>, StoreError> {
        let state = self.state.lock().await;
        let mut visible: Vec<_> = state.records.iter().filter(|r| r.visible).cloned().collect();
        visible.sort_by(|a, b| {
            b.published_at
                .cmp(&a.published_at)
                .then(b.created_at.cmp(&a.created_at))
        });
        Ok(visible.into_iter().skip(offset).take(limit).collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// Request errors never carry the URL, whose query may hold credentials.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

/// GET client with a per-request timeout and capped exponential backoff on
/// transient failures (5xx, 429, timeouts, connect errors).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// `query` may carry credentials. Only `url` reaches spans, and errors
    /// are stripped of the full request URL.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url, query).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await.map_err(request_error)?.to_vec();
                        return Ok(FetchedResponse { status, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        tracing::debug!(attempt, status = status.as_u16(), "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    let err = err.without_url();
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        tracing::debug!(attempt, error = %err, "retrying fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

fn request_error(err: reqwest::Error) -> FetchError {
    FetchError::Request(err.without_url())
}
