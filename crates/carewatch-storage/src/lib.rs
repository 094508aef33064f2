//! HTTP fetch + PostgreSQL persistence plumbing for carewatch.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use carewatch_core::{PartialRecord, SqlValue};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "carewatch-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!();

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

/// Fetch failure taxonomy. Transient failures have already been retried with
/// backoff by the client before they surface here.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transient fetch failure for {url} after {attempts} attempts: {reason}")]
    Transient {
        url: String,
        attempts: usize,
        reason: String,
    },
    #[error("fatal fetch failure: http status {status} for {url}")]
    Fatal { status: u16, url: String },
    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient { .. })
    }
}

/// Enforces a fixed minimum interval between outbound requests.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub async fn pace(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct SodaClientConfig {
    pub base_url: String,
    pub app_token: Option<String>,
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
    pub request_delay: Duration,
}

/// Query parameters for one page request beyond offset/limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageQuery<'a> {
    pub order: &'a str,
    pub where_clause: Option<&'a str>,
    pub select: Option<&'a str>,
}

/// Client for a Socrata-style dataset endpoint
/// (`GET {base}/{dataset}.json?$limit=&$offset=`).
#[derive(Debug)]
pub struct SodaClient {
    client: reqwest::Client,
    base_url: String,
    app_token: Option<String>,
    backoff: BackoffPolicy,
    pacer: RequestPacer,
}

impl SodaClient {
    pub fn new(config: SodaClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            app_token: config.app_token,
            backoff: config.backoff,
            pacer: RequestPacer::new(config.request_delay),
        })
    }

    /// Fetches one page of records. An empty vec means end-of-data.
    pub async fn fetch_page(
        &self,
        dataset_id: &str,
        offset: i64,
        limit: i64,
        query: &PageQuery<'_>,
    ) -> Result<Vec<JsonValue>, FetchError> {
        let url = format!("{}/{}.json", self.base_url.trim_end_matches('/'), dataset_id);
        let mut params = vec![
            ("$limit", limit.to_string()),
            ("$offset", offset.to_string()),
            ("$order", query.order.to_string()),
        ];
        if let Some(where_clause) = query.where_clause {
            params.push(("$where", where_clause.to_string()));
        }
        if let Some(select) = query.select {
            params.push(("$select", select.to_string()));
        }

        let mut last_transient = String::new();

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }
            self.pacer.pace().await;

            let mut request = self.client.get(&url).query(&params);
            if let Some(token) = &self.app_token {
                request = request.header("X-App-Token", token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<Vec<JsonValue>>().await.map_err(|err| {
                            FetchError::Malformed {
                                url: url.clone(),
                                reason: err.to_string(),
                            }
                        });
                    }
                    match classify_status(status) {
                        RetryDisposition::Retryable => {
                            warn!(dataset_id, offset, attempt, %status, "retryable page status");
                            last_transient = format!("http status {status}");
                        }
                        RetryDisposition::NonRetryable => {
                            return Err(FetchError::Fatal {
                                status: status.as_u16(),
                                url,
                            });
                        }
                    }
                }
                Err(err) => match classify_reqwest_error(&err) {
                    RetryDisposition::Retryable => {
                        warn!(dataset_id, offset, attempt, error = %err, "retryable fetch error");
                        last_transient = err.to_string();
                    }
                    RetryDisposition::NonRetryable => {
                        return Err(FetchError::Malformed {
                            url,
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }

        Err(FetchError::Transient {
            url,
            attempts: self.backoff.max_retries + 1,
            reason: last_transient,
        })
    }
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}

/// Target table description for the sparse upsert builder.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub table: &'static str,
    pub natural_key: &'static str,
    pub timestamp_column: Option<&'static str>,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record for {table} is missing natural key column {column}")]
    MissingNaturalKey {
        table: &'static str,
        column: &'static str,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The row exists and every incoming field already matches storage.
    Unchanged,
}

/// `INSERT INTO t (a, b) VALUES ($1, $2)` over the record's present columns.
pub fn build_insert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders = (1..=columns.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders})",
        columns.join(", ")
    )
}

/// Sparse update: sets only the given columns, leaves everything else
/// untouched, and skips the write entirely when nothing would change
/// (`IS DISTINCT FROM` guard). `$1` is the natural key.
pub fn build_update_sql(
    table: &str,
    natural_key: &str,
    columns: &[&str],
    timestamp_column: Option<&str>,
) -> String {
    let mut assignments = columns
        .iter()
        .enumerate()
        .map(|(i, column)| format!("{column} = ${}", i + 2))
        .collect::<Vec<_>>();
    if let Some(ts) = timestamp_column {
        assignments.push(format!("{ts} = now()"));
    }
    let placeholders = (0..columns.len())
        .map(|i| format!("${}", i + 2))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {table} SET {} WHERE {natural_key} = $1 AND ({}) IS DISTINCT FROM ({placeholders})",
        assignments.join(", "),
        columns.join(", ")
    )
}

pub fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Integer(v) => query.bind(*v),
        SqlValue::Float(v) => query.bind(*v),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
    }
}

/// Probe by natural key, then issue a sparse INSERT or UPDATE containing only
/// the fields present in `record`. Absent fields are never written.
pub async fn upsert_record(
    tx: &mut Transaction<'_, Postgres>,
    spec: &TableSpec,
    record: &PartialRecord,
) -> Result<UpsertOutcome, StorageError> {
    let Some(key) = record.get(spec.natural_key).cloned() else {
        return Err(StorageError::MissingNaturalKey {
            table: spec.table,
            column: spec.natural_key,
        });
    };

    let probe_sql = format!(
        "SELECT 1 FROM {} WHERE {} = $1",
        spec.table, spec.natural_key
    );
    let existing = bind_value(sqlx::query(&probe_sql), &key)
        .fetch_optional(&mut **tx)
        .await?;

    if existing.is_some() {
        let columns: Vec<&str> = record
            .columns()
            .filter(|column| *column != spec.natural_key)
            .collect();
        if columns.is_empty() {
            return Ok(UpsertOutcome::Unchanged);
        }
        let sql = build_update_sql(spec.table, spec.natural_key, &columns, spec.timestamp_column);
        let mut query = bind_value(sqlx::query(&sql), &key);
        for (column, value) in record.iter() {
            if column == spec.natural_key {
                continue;
            }
            query = bind_value(query, value);
        }
        let result = query.execute(&mut **tx).await?;
        if result.rows_affected() == 0 {
            Ok(UpsertOutcome::Unchanged)
        } else {
            Ok(UpsertOutcome::Updated)
        }
    } else {
        let columns: Vec<&str> = record.columns().collect();
        let sql = build_insert_sql(spec.table, &columns);
        let mut query = sqlx::query(&sql);
        for value in record.values() {
            query = bind_value(query, value);
        }
        query.execute(&mut **tx).await?;
        Ok(UpsertOutcome::Inserted)
    }
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed archive of raw fetched pages, written atomically.
/// Re-fetching identical page content deduplicates on the content hash.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(dataset: &str, content_hash: &str) -> PathBuf {
        PathBuf::from(dataset).join(format!("{content_hash}.json"))
    }

    pub async fn store_page(&self, dataset: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::page_relative_path(dataset, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating artifact directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.tmp", Uuid::new_v4());
        let temp_path = absolute_path
            .parent()
            .unwrap_or(&self.root)
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredArtifact {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredArtifact {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}
