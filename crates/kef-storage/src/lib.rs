//! Source fetching + persistence for the KEF importer.
//!
//! Two halves live here: turning an operator-shared sheet URL into parsed rows
//! (`resolve_export_endpoint`, [`HttpRowSource`]), and the stores the import pipeline
//! reads and writes (cursor, failure ledger, record writer, layout directory), each with
//! a Postgres implementation and an in-memory one.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use kef_core::{FailedImport, ImportCursor, LayoutField, MappedRow, NewFailure, ResponseRecord};
use regex::Regex;
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kef-storage";

const SHEETS_HOST: &str = "https://docs.google.com/spreadsheets/d";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

// ---------------------------------------------------------------------------
// Source endpoint resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid source {source_url:?}: {reason}")]
pub struct InvalidSourceError {
    pub source_url: String,
    pub reason: &'static str,
}

fn sheet_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/spreadsheets/d/([A-Za-z0-9_-]+)").expect("static regex"))
}

fn gid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[?&#]gid=([0-9]+)").expect("static regex"))
}

fn bare_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{25,}$").expect("static regex"))
}

/// Derive the CSV export endpoint for an operator-shared source URL.
///
/// Accepted inputs, in order:
/// - a shared spreadsheet link (`.../spreadsheets/d/<key>/edit?gid=<tab>#gid=<tab>`),
/// - a bare spreadsheet key,
/// - any other http(s) URL that already points at CSV (`*.csv` path or `format=csv`).
///
/// The result is deterministic for a given input.
pub fn resolve_export_endpoint(source_url: &str) -> Result<String, InvalidSourceError> {
    let trimmed = source_url.trim();
    let invalid = |reason| InvalidSourceError {
        source_url: source_url.to_string(),
        reason,
    };
    if trimmed.is_empty() {
        return Err(invalid("source url is empty"));
    }

    if let Some(caps) = sheet_id_re().captures(trimmed) {
        let key = &caps[1];
        let mut endpoint = format!("{SHEETS_HOST}/{key}/export?format=csv");
        if let Some(gid) = gid_re().captures(trimmed) {
            endpoint.push_str("&gid=");
            endpoint.push_str(&gid[1]);
        }
        return Ok(endpoint);
    }

    if bare_key_re().is_match(trimmed) {
        return Ok(format!("{SHEETS_HOST}/{trimmed}/export?format=csv"));
    }

    let url = Url::parse(trimmed).map_err(|_| invalid("no spreadsheet key or url found"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("only http and https sources are supported"));
    }
    let is_csv_path = url.path().to_ascii_lowercase().ends_with(".csv");
    let is_csv_query = url
        .query_pairs()
        .any(|(k, v)| k == "format" && v.eq_ignore_ascii_case("csv"));
    if is_csv_path || is_csv_query {
        Ok(url.to_string())
    } else {
        Err(invalid("url does not point at a spreadsheet or a csv export"))
    }
}

// ---------------------------------------------------------------------------
// HTTP fetch + CSV parsing
// ---------------------------------------------------------------------------

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

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed csv export: {0}")]
    Parse(#[from] csv::Error),
}

impl FetchError {
    /// Whether the next scheduled cycle has a realistic chance of succeeding unchanged.
    pub fn is_transient(&self) -> bool {
        let disposition = match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Parse(_) => RetryDisposition::NonRetryable,
        };
        disposition == RetryDisposition::Retryable
    }
}

/// Parse a delimited export into rows of cells.
///
/// Row `n` of the result is sheet row `n + 1`. Fully empty lines are kept as empty rows
/// so positions keep matching the sheet.
pub fn parse_csv_rows(body: &[u8]) -> Result<Vec<Vec<String>>, FetchError> {
    let body = body.strip_prefix(UTF8_BOM).unwrap_or(body);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body);

    // The reader skips empty lines without counting them, so physical lines are
    // recovered from the byte offset where each record ends.
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut record = csv::StringRecord::new();
    let mut next_line = 1usize;
    let mut scanned = 0usize;
    let mut newlines = 0usize;
    while reader.read_record(&mut record)? {
        let end = usize::try_from(reader.position().byte())
            .unwrap_or(body.len())
            .min(body.len());
        newlines += body[scanned..end].iter().filter(|&&b| b == b'\n').count();
        scanned = end;
        let last_line = if end > 0 && body[end - 1] == b'\n' {
            newlines
        } else {
            newlines + 1
        };

        let cells: Vec<String> = record.iter().map(str::to_string).collect();
        let embedded_newlines: usize = cells.iter().map(|c| c.matches('\n').count()).sum();
        let first_line = last_line.saturating_sub(embedded_newlines);
        while next_line < first_line {
            rows.push(Vec::new());
            next_line += 1;
        }
        next_line = last_line + 1;
        rows.push(cells);
    }
    Ok(rows)
}

/// Stable content fingerprint of a raw row, used to detect sheet edits between a
/// failure and its retry.
pub fn row_fingerprint(row: &[String]) -> String {
    let mut hasher = Sha256::new();
    for cell in row {
        hasher.update((cell.len() as u64).to_le_bytes());
        hasher.update(cell.as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// Shorter timeout used when an operator is waiting on a connection check.
    pub probe_timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            user_agent: None,
        }
    }
}

/// Where the pipeline gets its rows from.
#[async_trait]
pub trait RowSource: Send + Sync {
    fn resolve_export_endpoint(&self, source_url: &str) -> Result<String, InvalidSourceError> {
        resolve_export_endpoint(source_url)
    }

    async fn fetch_rows(&self, endpoint: &str) -> Result<Vec<Vec<String>>, FetchError>;

    /// Same as `fetch_rows`, bounded by the short operator-facing timeout.
    async fn probe_rows(&self, endpoint: &str) -> Result<Vec<Vec<String>>, FetchError> {
        self.fetch_rows(endpoint).await
    }
}

#[derive(Debug, Clone)]
pub struct HttpRowSource {
    client: reqwest::Client,
    timeout: Duration,
    probe_timeout: Duration,
}

impl HttpRowSource {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            timeout: config.timeout,
            probe_timeout: config.probe_timeout,
        })
    }

    /// One GET, no in-cycle retries: a failed fetch is retried by the next scheduled cycle.
    pub async fn fetch_bytes(&self, url: &str, timeout: Duration) -> Result<Vec<u8>, FetchError> {
        let fetch_id = Uuid::new_v4();
        let timeout_ms = timeout.as_millis() as u64;
        let span = info_span!("http_fetch", %fetch_id, url, timeout_ms);
        async move {
            let resp = self.client.get(url).timeout(timeout).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), final_url = %final_url, "fetched export");
            Ok(body)
        }
        .instrument(span)
        .await
    }

    async fn fetch_rows_within(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Vec<Vec<String>>, FetchError> {
        let body = self.fetch_bytes(endpoint, timeout).await?;
        let rows = parse_csv_rows(&body)?;
        info!(rows = rows.len(), endpoint, "parsed export");
        Ok(rows)
    }
}

#[async_trait]
impl RowSource for HttpRowSource {
    async fn fetch_rows(&self, endpoint: &str) -> Result<Vec<Vec<String>>, FetchError> {
        self.fetch_rows_within(endpoint, self.timeout).await
    }

    async fn probe_rows(&self, endpoint: &str) -> Result<Vec<Vec<String>>, FetchError> {
        self.fetch_rows_within(endpoint, self.probe_timeout).await
    }
}

// ---------------------------------------------------------------------------
// Persistence contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid stored value: {0}")]
    Invalid(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Singleton import configuration and its progress cursor.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// The configuration row whether or not it is active.
    async fn get_config(&self) -> Result<Option<ImportCursor>, StoreError>;

    async fn get_active_config(&self) -> Result<Option<ImportCursor>, StoreError> {
        Ok(self.get_config().await?.filter(|c| c.active))
    }

    /// Create or replace the configuration and activate it. The cursor survives when the
    /// source url is unchanged and restarts at 0 otherwise.
    async fn upsert_config(
        &self,
        source_url: &str,
        poll_interval_secs: u64,
    ) -> Result<ImportCursor, StoreError>;

    /// Compare-and-set advance for the cycle that read `source_url`. Returns false (and
    /// changes nothing) when the source has since been replaced or `new_last_row` is not
    /// strictly greater than the stored value. The active flag is not consulted: rows a
    /// cycle already wrote stay accounted for after a mid-cycle deactivation.
    async fn advance(&self, source_url: &str, new_last_row: u32) -> Result<bool, StoreError>;

    /// Administrative override; may move the cursor backwards.
    async fn reset(&self, row_number: u32) -> Result<ImportCursor, StoreError>;

    /// Returns false when there was no active configuration to deactivate.
    async fn deactivate(&self) -> Result<bool, StoreError>;
}

/// Append-only ledger of per-row failures.
#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn record_failure(&self, failure: NewFailure) -> Result<i64, StoreError>;

    /// Open (unresolved) failures ordered by sheet row, then id.
    async fn list_open_failures(&self) -> Result<Vec<FailedImport>, StoreError>;

    async fn get_failure(&self, id: i64) -> Result<Option<FailedImport>, StoreError>;

    async fn mark_resolved(&self, id: i64, res_id: i64) -> Result<(), StoreError>;

    /// Bump `retry_count` and keep the newest error message. Leaves the entry open.
    async fn record_retry_failure(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<FailedImport, StoreError>;

    async fn delete_failure(&self, id: i64) -> Result<bool, StoreError>;

    /// Deletes every open failure; resolved entries stay as history.
    async fn delete_all_failures(&self) -> Result<u64, StoreError>;
}

/// Writes one mapped row as one record, atomically.
#[async_trait]
pub trait RecordWriter: Send + Sync {
    /// Allocates `max(res_id) + 1` (or 1) and persists the header plus every value pair in
    /// a single unit.
    async fn write(&self, row: &MappedRow) -> Result<i64, StoreError>;

    async fn count_records(&self) -> Result<u64, StoreError>;
}

/// Date-scoped registry of field definitions, owned by the layout editor.
#[async_trait]
pub trait LayoutDirectory: Send + Sync {
    /// Every field (metadata and assessment) whose validity window contains `date`.
    async fn fields_valid_on(&self, date: NaiveDate) -> Result<Vec<LayoutField>, StoreError>;
}

// ---------------------------------------------------------------------------
// Postgres implementation
// ---------------------------------------------------------------------------

const CONFIG_ID: i16 = 1;
/// Advisory lock key serializing `res_id` allocation across processes.
const RES_ID_LOCK_KEY: i64 = 0x6b65_665f_7265_73;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    fn cursor_from_row(row: &PgRow) -> Result<ImportCursor, StoreError> {
        Ok(ImportCursor {
            source_url: row.try_get("source_url")?,
            last_row_processed: to_u32(row.try_get("last_row_processed")?, "last_row_processed")?,
            poll_interval_secs: to_u64(row.try_get("poll_interval_secs")?, "poll_interval_secs")?,
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn failure_from_row(row: &PgRow) -> Result<FailedImport, StoreError> {
        let raw: Json<Vec<String>> = row.try_get("raw_row_data")?;
        let retry_count: i32 = row.try_get("retry_count")?;
        Ok(FailedImport {
            id: row.try_get("id")?,
            sheet_row_number: to_u32(row.try_get("sheet_row_number")?, "sheet_row_number")?,
            raw_row_data: raw.0,
            row_fingerprint: row.try_get("row_fingerprint")?,
            error_message: row.try_get("error_message")?,
            failed_at: row.try_get("failed_at")?,
            retry_count: u32::try_from(retry_count)
                .map_err(|_| StoreError::Invalid(format!("retry_count {retry_count}")))?,
            resolved: row.try_get("resolved")?,
            resolved_res_id: row.try_get("resolved_res_id")?,
        })
    }

    fn layout_from_row(row: &PgRow) -> Result<LayoutField, StoreError> {
        let field_id: i32 = row.try_get("field_id")?;
        Ok(LayoutField {
            field_id: u32::try_from(field_id)
                .map_err(|_| StoreError::Invalid(format!("field_id {field_id}")))?,
            domain: row.try_get("domain")?,
            subdomain: row.try_get("subdomain")?,
            name: row.try_get("name")?,
            valid_from: row.try_get("valid_from")?,
            valid_to: row.try_get("valid_to")?,
        })
    }
}

fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Invalid(format!("{column} = {value}")))
}

fn to_u64(value: i64, column: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Invalid(format!("{column} = {value}")))
}

fn to_i64(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Invalid(format!("{column} = {value}")))
}

const CURSOR_COLUMNS: &str =
    "source_url, last_row_processed, poll_interval_secs, active, created_at, updated_at";
const FAILURE_COLUMNS: &str = "id, sheet_row_number, raw_row_data, row_fingerprint, error_message, \
     failed_at, retry_count, resolved, resolved_res_id";

#[async_trait]
impl CursorStore for PgStore {
    async fn get_config(&self) -> Result<Option<ImportCursor>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CURSOR_COLUMNS} FROM import_config WHERE id = $1"
        ))
        .bind(CONFIG_ID)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::cursor_from_row).transpose()
    }

    async fn upsert_config(
        &self,
        source_url: &str,
        poll_interval_secs: u64,
    ) -> Result<ImportCursor, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO import_config (id, source_url, last_row_processed, poll_interval_secs, active)
            VALUES ($1, $2, 0, $3, TRUE)
            ON CONFLICT (id) DO UPDATE SET
                last_row_processed = CASE
                    WHEN import_config.source_url = EXCLUDED.source_url
                        THEN import_config.last_row_processed
                    ELSE 0
                END,
                source_url = EXCLUDED.source_url,
                poll_interval_secs = EXCLUDED.poll_interval_secs,
                active = TRUE,
                updated_at = now()
            RETURNING {CURSOR_COLUMNS}
            "#
        ))
        .bind(CONFIG_ID)
        .bind(source_url)
        .bind(to_i64(poll_interval_secs, "poll_interval_secs")?)
        .fetch_one(&self.pool)
        .await?;
        Self::cursor_from_row(&row)
    }

    async fn advance(&self, source_url: &str, new_last_row: u32) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE import_config
               SET last_row_processed = $2, updated_at = now()
             WHERE id = $1 AND source_url = $3 AND last_row_processed < $2
            "#,
        )
        .bind(CONFIG_ID)
        .bind(i64::from(new_last_row))
        .bind(source_url)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset(&self, row_number: u32) -> Result<ImportCursor, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE import_config
               SET last_row_processed = $2, updated_at = now()
             WHERE id = $1
            RETURNING {CURSOR_COLUMNS}
            "#
        ))
        .bind(CONFIG_ID)
        .bind(i64::from(row_number))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::cursor_from_row(&row),
            None => Err(StoreError::NotFound("import configuration".into())),
        }
    }

    async fn deactivate(&self) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE import_config SET active = FALSE, updated_at = now() WHERE id = $1 AND active",
        )
        .bind(CONFIG_ID)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl FailureStore for PgStore {
    async fn record_failure(&self, failure: NewFailure) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO failed_imports (sheet_row_number, raw_row_data, row_fingerprint, error_message)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(i64::from(failure.sheet_row_number))
        .bind(Json(&failure.raw_row_data))
        .bind(&failure.row_fingerprint)
        .bind(&failure.error_message)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn list_open_failures(&self) -> Result<Vec<FailedImport>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {FAILURE_COLUMNS} FROM failed_imports WHERE NOT resolved ORDER BY sheet_row_number, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::failure_from_row).collect()
    }

    async fn get_failure(&self, id: i64) -> Result<Option<FailedImport>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {FAILURE_COLUMNS} FROM failed_imports WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::failure_from_row).transpose()
    }

    async fn mark_resolved(&self, id: i64, res_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE failed_imports
               SET resolved = TRUE, resolved_at = now(), resolved_res_id = $2
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(res_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("failed import {id}")));
        }
        Ok(())
    }

    async fn record_retry_failure(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<FailedImport, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE failed_imports
               SET retry_count = retry_count + 1, error_message = $2
             WHERE id = $1
            RETURNING {FAILURE_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Self::failure_from_row(&row),
            None => Err(StoreError::NotFound(format!("failed import {id}"))),
        }
    }

    async fn delete_failure(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM failed_imports WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_all_failures(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM failed_imports WHERE NOT resolved")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RecordWriter for PgStore {
    async fn write(&self, row: &MappedRow) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(RES_ID_LOCK_KEY)
            .execute(&mut *tx)
            .await?;
        let res_id: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(res_id), 0) + 1 FROM response_records")
                .fetch_one(&mut *tx)
                .await?;

        let meta = &row.metadata;
        sqlx::query(
            r#"
            INSERT INTO response_records
                (res_id, sheet_row_number, school, grade, teacher, assessment,
                 student_name, date_text, effective_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(res_id)
        .bind(i64::from(row.sheet_row_number))
        .bind(&meta.school)
        .bind(&meta.grade)
        .bind(&meta.teacher)
        .bind(&meta.assessment)
        .bind(&meta.name)
        .bind(&meta.date)
        .bind(meta.effective_date)
        .execute(&mut *tx)
        .await?;

        for (field_id, value) in &row.res_fields {
            let field_id = i32::try_from(*field_id)
                .map_err(|_| StoreError::Invalid(format!("field_id {field_id}")))?;
            sqlx::query(
                r#"
                INSERT INTO response_values (res_id, field_id, value_numeric, value_text)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(res_id)
            .bind(field_id)
            .bind(value.as_score())
            .bind(value.as_text())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(res_id)
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM response_records")
            .fetch_one(&self.pool)
            .await?;
        to_u64(count, "count")
    }
}

#[async_trait]
impl LayoutDirectory for PgStore {
    async fn fields_valid_on(&self, date: NaiveDate) -> Result<Vec<LayoutField>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT field_id, domain, subdomain, name, valid_from, valid_to
              FROM layout_fields
             WHERE valid_from <= $1 AND valid_to >= $1
             ORDER BY field_id, id
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::layout_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MemoryState {
    cursor: Option<ImportCursor>,
    failures: BTreeMap<i64, FailedImport>,
    next_failure_id: i64,
    records: BTreeMap<i64, ResponseRecord>,
    layout: Vec<LayoutField>,
    failing_write_rows: HashSet<u32>,
    ledger_unavailable: bool,
}

/// Process-local store implementing every persistence contract. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layout(fields: Vec<LayoutField>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                layout: fields,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn set_layout(&self, fields: Vec<LayoutField>) {
        self.state.lock().await.layout = fields;
    }

    /// Make `write` fail for the given sheet row until cleared.
    pub async fn fail_writes_for_row(&self, sheet_row_number: u32) {
        self.state.lock().await.failing_write_rows.insert(sheet_row_number);
    }

    pub async fn clear_write_failures(&self) {
        self.state.lock().await.failing_write_rows.clear();
    }

    pub async fn set_ledger_unavailable(&self, unavailable: bool) {
        self.state.lock().await.ledger_unavailable = unavailable;
    }

    pub async fn records(&self) -> Vec<ResponseRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn all_failures(&self) -> Vec<FailedImport> {
        self.state.lock().await.failures.values().cloned().collect()
    }
}

#[async_trait]
impl CursorStore for MemoryStore {
    async fn get_config(&self) -> Result<Option<ImportCursor>, StoreError> {
        Ok(self.state.lock().await.cursor.clone())
    }

    async fn upsert_config(
        &self,
        source_url: &str,
        poll_interval_secs: u64,
    ) -> Result<ImportCursor, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let cursor = match state.cursor.take() {
            Some(prev) => ImportCursor {
                last_row_processed: if prev.source_url == source_url {
                    prev.last_row_processed
                } else {
                    0
                },
                source_url: source_url.to_string(),
                poll_interval_secs,
                active: true,
                created_at: prev.created_at,
                updated_at: now,
            },
            None => ImportCursor {
                source_url: source_url.to_string(),
                last_row_processed: 0,
                poll_interval_secs,
                active: true,
                created_at: now,
                updated_at: now,
            },
        };
        state.cursor = Some(cursor.clone());
        Ok(cursor)
    }

    async fn advance(&self, source_url: &str, new_last_row: u32) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.cursor.as_mut() {
            Some(c) if c.source_url == source_url && new_last_row > c.last_row_processed => {
                c.last_row_processed = new_last_row;
                c.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset(&self, row_number: u32) -> Result<ImportCursor, StoreError> {
        let mut state = self.state.lock().await;
        let cursor = state
            .cursor
            .as_mut()
            .ok_or_else(|| StoreError::NotFound("import configuration".into()))?;
        cursor.last_row_processed = row_number;
        cursor.updated_at = Utc::now();
        Ok(cursor.clone())
    }

    async fn deactivate(&self) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.cursor.as_mut() {
            Some(c) if c.active => {
                c.active = false;
                c.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl FailureStore for MemoryStore {
    async fn record_failure(&self, failure: NewFailure) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if state.ledger_unavailable {
            return Err(StoreError::Unavailable("failure ledger offline".into()));
        }
        state.next_failure_id += 1;
        let id = state.next_failure_id;
        state.failures.insert(
            id,
            FailedImport {
                id,
                sheet_row_number: failure.sheet_row_number,
                raw_row_data: failure.raw_row_data,
                row_fingerprint: failure.row_fingerprint,
                error_message: failure.error_message,
                failed_at: Utc::now(),
                retry_count: 0,
                resolved: false,
                resolved_res_id: None,
            },
        );
        Ok(id)
    }

    async fn list_open_failures(&self) -> Result<Vec<FailedImport>, StoreError> {
        let state = self.state.lock().await;
        let mut open: Vec<FailedImport> = state
            .failures
            .values()
            .filter(|f| !f.resolved)
            .cloned()
            .collect();
        open.sort_by_key(|f| (f.sheet_row_number, f.id));
        Ok(open)
    }

    async fn get_failure(&self, id: i64) -> Result<Option<FailedImport>, StoreError> {
        Ok(self.state.lock().await.failures.get(&id).cloned())
    }

    async fn mark_resolved(&self, id: i64, res_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let failure = state
            .failures
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("failed import {id}")))?;
        failure.resolved = true;
        failure.resolved_res_id = Some(res_id);
        Ok(())
    }

    async fn record_retry_failure(
        &self,
        id: i64,
        error_message: &str,
    ) -> Result<FailedImport, StoreError> {
        let mut state = self.state.lock().await;
        let failure = state
            .failures
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("failed import {id}")))?;
        failure.retry_count += 1;
        failure.error_message = error_message.to_string();
        Ok(failure.clone())
    }

    async fn delete_failure(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.failures.remove(&id).is_some())
    }

    async fn delete_all_failures(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.failures.len();
        state.failures.retain(|_, f| f.resolved);
        Ok((before - state.failures.len()) as u64)
    }
}

#[async_trait]
impl RecordWriter for MemoryStore {
    async fn write(&self, row: &MappedRow) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_write_rows.contains(&row.sheet_row_number) {
            return Err(StoreError::Unavailable(format!(
                "write rejected for row {}",
                row.sheet_row_number
            )));
        }
        let res_id = state.records.keys().next_back().copied().unwrap_or(0) + 1;
        state.records.insert(
            res_id,
            ResponseRecord {
                res_id,
                sheet_row_number: row.sheet_row_number,
                metadata: row.metadata.clone(),
                values: row.res_fields.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(res_id)
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.records.len() as u64)
    }
}

#[async_trait]
impl LayoutDirectory for MemoryStore {
    async fn fields_valid_on(&self, date: NaiveDate) -> Result<Vec<LayoutField>, StoreError> {
        let state = self.state.lock().await;
        let mut fields: Vec<LayoutField> = state
            .layout
            .iter()
            .filter(|f| f.is_valid_on(date))
            .cloned()
            .collect();
        fields.sort_by_key(|f| f.field_id);
        Ok(fields)
    }
}
