//! Listing store backends, the processed-file change log, and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use idxr_core::{
    parse_numeric, InactiveMark, ListingQuery, ListingRecord, ProcessedFileEntry, Snapshot,
    StoredListing, PROMOTED_FIELDS, RAW_DATA_KEY,
};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "idxr-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ProcessedFileLog {
    path: PathBuf,
    entries: BTreeMap<String, ProcessedFileEntry>,
}

impl ProcessedFileLog {
    pub const FILE_NAME: &'static str = "processed_files.json";

    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Self::empty(path),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "processed-file log unreadable; reprocessing all files");
                return Self::empty(path);
            }
        };
        match serde_json::from_str::<BTreeMap<String, ProcessedFileEntry>>(&text) {
            Ok(entries) => Self { path, entries },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "processed-file log corrupt; reprocessing all files");
                Self::empty(path)
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry(&self, file_name: &str) -> Option<&ProcessedFileEntry> {
        self.entries.get(file_name)
    }

    pub fn has_changed(&self, file_name: &str, content_hash: &str) -> bool {
        self.entries
            .get(file_name)
            .map(|entry| entry.hash != content_hash)
            .unwrap_or(true)
    }

    pub fn record(
        &mut self,
        file_name: &str,
        content_hash: &str,
        file_path: &Path,
        processed_at: DateTime<Utc>,
    ) {
        self.entries.insert(
            file_name.to_string(),
            ProcessedFileEntry {
                hash: content_hash.to_string(),
                processed_at,
                file_path: file_path.display().to_string(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let bytes =
            serde_json::to_vec_pretty(&self.entries).context("serializing processed-file log")?;
        write_atomic(&self.path, &bytes).await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Persistence seam for listings. The reconciliation writer is its only mutator.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn load_snapshot(&self) -> Result<Snapshot, StoreError>;

    async fn upsert_batch(
        &self,
        records: &[ListingRecord],
        applied_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn update_batch(
        &self,
        records: &[ListingRecord],
        applied_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Flip status and merge the audit annotation; rows already inactive are left alone.
    async fn mark_inactive_batch(
        &self,
        listing_keys: &[String],
        mark: &InactiveMark,
    ) -> Result<u64, StoreError>;

    async fn list_listings(&self, query: &ListingQuery) -> Result<Vec<StoredListing>, StoreError>;
}

fn promoted_column_list() -> String {
    PROMOTED_FIELDS
        .iter()
        .map(|(_, column)| *column)
        .collect::<Vec<_>>()
        .join(", ")
}

fn agent_id_of(data: &JsonValue) -> Option<&str> {
    data.get("LIST_AGENT_ID")
        .or_else(|| data.get(RAW_DATA_KEY).and_then(|raw| raw.get("LIST_AGENT_ID")))
        .and_then(JsonValue::as_str)
}

fn push_listing_values(builder: &mut QueryBuilder<'static, Postgres>, records: &[ListingRecord], applied_at: DateTime<Utc>) {
    builder.push_values(records, |mut b, record| {
        b.push_bind(record.listing_key.clone());
        for value in record.promoted_values() {
            b.push_bind(value);
        }
        b.push_bind(Json(record.to_document()))
            .push_bind(applied_at);
    });
}

fn upsert_query(records: &[ListingRecord], applied_at: DateTime<Utc>) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO listings (listing_key, {}, data, updated_at) ",
        promoted_column_list()
    ));
    push_listing_values(&mut builder, records, applied_at);
    let assignments = PROMOTED_FIELDS
        .iter()
        .map(|(_, column)| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    builder.push(format!(
        " ON CONFLICT (listing_key) DO UPDATE SET {assignments}, data = EXCLUDED.data, updated_at = EXCLUDED.updated_at"
    ));
    builder
}

fn update_query(records: &[ListingRecord], applied_at: DateTime<Utc>) -> QueryBuilder<'static, Postgres> {
    let assignments = PROMOTED_FIELDS
        .iter()
        .map(|(_, column)| format!("{column} = v.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    let mut builder = QueryBuilder::new(format!(
        "UPDATE listings AS l SET {assignments}, data = v.data, updated_at = v.updated_at FROM ("
    ));
    push_listing_values(&mut builder, records, applied_at);
    builder.push(format!(
        ") AS v(listing_key, {}, data, updated_at) WHERE l.listing_key = v.listing_key",
        promoted_column_list()
    ));
    builder
}

fn listing_query(query: &ListingQuery) -> QueryBuilder<'static, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "SELECT listing_key, {}, data, updated_at FROM listings WHERE TRUE",
        promoted_column_list()
    ));
    if let Some(city) = &query.city {
        builder
            .push(" AND city ILIKE ")
            .push_bind(format!("%{city}%"));
    }
    if let Some(status) = &query.status {
        builder.push(" AND listing_status = ").push_bind(status.clone());
    }
    let price = "COALESCE(NULLIF(regexp_replace(list_price, '[^0-9.]', '', 'g'), '')::numeric, 0)";
    if let Some(min_price) = query.min_price {
        builder
            .push(format!(" AND {price} >= "))
            .push_bind(min_price);
    }
    if let Some(max_price) = query.max_price {
        builder
            .push(format!(" AND {price} <= "))
            .push_bind(max_price);
    }
    if let Some(min_bedrooms) = query.min_bedrooms {
        builder
            .push(" AND COALESCE(NULLIF(regexp_replace(bedrooms_total, '[^0-9.]', '', 'g'), '')::numeric, 0) >= ")
            .push_bind(min_bedrooms);
    }
    builder.push(" ORDER BY ");
    if let Some(agent) = &query.priority_agent_id {
        builder
            .push("CASE WHEN COALESCE(data->>'LIST_AGENT_ID', data->'_raw_data'->>'LIST_AGENT_ID') = ")
            .push_bind(agent.clone())
            .push(" THEN 0 ELSE 1 END, ");
    }
    builder
        .push("updated_at DESC, listing_key LIMIT ")
        .push_bind(query.limit.max(1))
        .push(" OFFSET ")
        .push_bind(query.offset.max(0));
    builder
}

#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_stored(row: &sqlx::postgres::PgRow) -> Result<StoredListing, StoreError> {
        let mut columns = BTreeMap::new();
        for (_, column) in PROMOTED_FIELDS {
            let value: Option<String> = row.try_get(*column)?;
            columns.insert(column.to_string(), value);
        }
        Ok(StoredListing {
            listing_key: row.try_get("listing_key")?,
            columns,
            data: row.try_get("data")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT listing_key, listing_status, data, updated_at
              FROM listings
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = Snapshot::new();
        for row in rows {
            let key: String = row.try_get("listing_key")?;
            snapshot.insert(
                key,
                idxr_core::SnapshotEntry {
                    document: row.try_get("data")?,
                    listing_status: row.try_get("listing_status")?,
                    updated_at: row.try_get("updated_at")?,
                },
            );
        }
        Ok(snapshot)
    }

    async fn upsert_batch(
        &self,
        records: &[ListingRecord],
        applied_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut builder = upsert_query(records, applied_at);
        let mut tx = self.pool.begin().await?;
        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn update_batch(
        &self,
        records: &[ListingRecord],
        applied_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut builder = update_query(records, applied_at);
        let mut tx = self.pool.begin().await?;
        let result = builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn mark_inactive_batch(
        &self,
        listing_keys: &[String],
        mark: &InactiveMark,
    ) -> Result<u64, StoreError> {
        if listing_keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE listings
               SET listing_status = $1,
                   data = data || $2,
                   updated_at = $3
             WHERE listing_key = ANY($4)
               AND listing_status IS DISTINCT FROM $1
            "#,
        )
        .bind(&mark.status)
        .bind(Json(mark.annotation()))
        .bind(mark.marked_at)
        .bind(listing_keys)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn list_listings(&self, query: &ListingQuery) -> Result<Vec<StoredListing>, StoreError> {
        let mut builder = listing_query(query);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_stored).collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: Mutex<BTreeMap<String, StoredListing>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listings(listings: impl IntoIterator<Item = StoredListing>) -> Self {
        let rows = listings
            .into_iter()
            .map(|listing| (listing.listing_key.clone(), listing))
            .collect();
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub async fn listings(&self) -> Vec<StoredListing> {
        self.rows.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, listing_key: &str) -> Option<StoredListing> {
        self.rows.lock().await.get(listing_key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .map(|(key, listing)| (key.clone(), listing.to_snapshot_entry()))
            .collect())
    }

    async fn upsert_batch(
        &self,
        records: &[ListingRecord],
        applied_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        for record in records {
            rows.insert(
                record.listing_key.clone(),
                StoredListing::from_record(record, applied_at),
            );
        }
        Ok(records.len() as u64)
    }

    async fn update_batch(
        &self,
        records: &[ListingRecord],
        applied_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut affected = 0;
        for record in records {
            if let Some(existing) = rows.get_mut(&record.listing_key) {
                *existing = StoredListing::from_record(record, applied_at);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn mark_inactive_batch(
        &self,
        listing_keys: &[String],
        mark: &InactiveMark,
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut affected = 0;
        for key in listing_keys {
            let Some(listing) = rows.get_mut(key) else {
                continue;
            };
            if listing.listing_status() == Some(mark.status.as_str()) {
                continue;
            }
            listing.set_listing_status(&mark.status);
            mark.merge_into(&mut listing.data);
            listing.updated_at = mark.marked_at;
            affected += 1;
        }
        Ok(affected)
    }

    async fn list_listings(&self, query: &ListingQuery) -> Result<Vec<StoredListing>, StoreError> {
        let rows = self.rows.lock().await;
        let column_number = |listing: &StoredListing, column: &str| {
            listing
                .columns
                .get(column)
                .and_then(|v| v.as_deref())
                .and_then(parse_numeric)
                .unwrap_or(0.0)
        };
        let city_needle = query.city.as_ref().map(|c| c.to_lowercase());

        let mut matched = rows
            .values()
            .filter(|listing| {
                city_needle.as_ref().map_or(true, |needle| {
                    listing
                        .columns
                        .get("city")
                        .and_then(|v| v.as_deref())
                        .map(|city| city.to_lowercase().contains(needle))
                        .unwrap_or(false)
                })
            })
            .filter(|listing| {
                query
                    .status
                    .as_deref()
                    .map_or(true, |status| listing.listing_status() == Some(status))
            })
            .filter(|listing| {
                query
                    .min_price
                    .map_or(true, |min| column_number(listing, "list_price") >= min as f64)
            })
            .filter(|listing| {
                query
                    .max_price
                    .map_or(true, |max| column_number(listing, "list_price") <= max as f64)
            })
            .filter(|listing| {
                query
                    .min_bedrooms
                    .map_or(true, |min| column_number(listing, "bedrooms_total") >= min as f64)
            })
            .cloned()
            .collect::<Vec<_>>();

        let priority = query.priority_agent_id.as_deref();
        matched.sort_by(|a, b| {
            let rank = |l: &StoredListing| match priority {
                Some(agent) if agent_id_of(&l.data) == Some(agent) => 0,
                _ => 1,
            };
            rank(a)
                .cmp(&rank(b))
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.listing_key.cmp(&b.listing_key))
        });

        Ok(matched
            .into_iter()
            .skip(query.offset.max(0) as usize)
            .take(query.limit.max(1) as usize)
            .collect())
    }
}

#[async_trait]
impl<S: ListingStore + ?Sized> ListingStore for Arc<S> {
    async fn load_snapshot(&self) -> Result<Snapshot, StoreError> {
        (**self).load_snapshot().await
    }

    async fn upsert_batch(
        &self,
        records: &[ListingRecord],
        applied_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).upsert_batch(records, applied_at).await
    }

    async fn update_batch(
        &self,
        records: &[ListingRecord],
        applied_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        (**self).update_batch(records, applied_at).await
    }

    async fn mark_inactive_batch(
        &self,
        listing_keys: &[String],
        mark: &InactiveMark,
    ) -> Result<u64, StoreError> {
        (**self).mark_inactive_batch(listing_keys, mark).await
    }

    async fn list_listings(&self, query: &ListingQuery) -> Result<Vec<StoredListing>, StoreError> {
        (**self).list_listings(query).await
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
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
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_concurrency: 2,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
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
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        label: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_fetch", %run_id, label);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying feed download");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying feed download");
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
